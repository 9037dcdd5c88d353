//! Canonical wire text for a net
//!
//! Children are written in insertion order. A leaf lists its connected
//! in-ports (declaration order) before its valued parameters; unconnected
//! in-ports and parameters without a value are left out; a debug retention
//! only exists on a connected in-port. A nested fragment is
//! written as its own `{...}` body, followed by `(in..=source,...)` when any of
//! its boundary inputs is connected. Boundary outputs close the fragment.
//! Sources are never inlined, so parsing the text back yields the same names.

use crate::net::{Fragment, InPort, NodeBody, OutPortRef, Primitive};
use std::fmt;

pub fn serialize(fragment: &Fragment) -> String {
    let mut buf = String::new();
    write_fragment(fragment, &mut buf);
    buf
}

fn write_fragment(fragment: &Fragment, buf: &mut String) {
    let mut items = Vec::new();
    for (_, node) in fragment.children() {
        let mut item = format!("{}=", node.name());
        match node.body() {
            NodeBody::Primitive(primitive) => write_primitive(fragment, primitive, &mut item),
            NodeBody::Fragment(inner) => {
                write_fragment(inner, &mut item);
                let args = connections(fragment, inner.inputs());
                if !args.is_empty() {
                    item.push('(');
                    item.push_str(&args.join(","));
                    item.push(')');
                }
            }
        }
        items.push(item);
    }
    for output in fragment.outputs() {
        if let Some(source) = source_text(fragment, output.source()) {
            items.push(format!("{}={}", output.name(), source));
        }
    }
    buf.push('{');
    buf.push_str(&items.join(","));
    buf.push('}');
}

fn write_primitive(scope: &Fragment, primitive: &Primitive, buf: &mut String) {
    let mut items = connections(scope, primitive.in_ports());
    items.extend(
        primitive
            .parameters()
            .iter()
            .filter_map(|p| p.value().map(|value| format!("{}='{}'", p.name(), value))),
    );
    buf.push_str(primitive.type_name());
    buf.push('(');
    buf.push_str(&items.join(","));
    buf.push(')');
}

/// `port[retention]=owner.port` for every connected in-port; sources resolve in `scope`
fn connections(scope: &Fragment, ports: &[InPort]) -> Vec<String> {
    ports
        .iter()
        .filter_map(|port| {
            let source = source_text(scope, port.source()?)?;
            Some(match port.debug_retention() {
                Some(seconds) => format!("{}[{}]={}", port.name(), seconds, source),
                None => format!("{}={}", port.name(), source),
            })
        })
        .collect()
}

fn source_text(scope: &Fragment, source: OutPortRef) -> Option<String> {
    scope
        .describe_source(source)
        .map(|(owner, port)| format!("{}.{}", owner, port))
}

impl fmt::Display for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&serialize(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Primitive;
    use crate::parser::parse;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_add_example_is_byte_identical() {
        let text = "{add=Core::Add(first=parent.ina,second='1.0'),outResult=add.outValue}";
        let net = parse(text).unwrap();
        assert_eq!(net.input_names(), vec!["ina"]);
        assert_eq!(net.output_names(), vec!["outResult"]);
        assert_eq!(serialize(&net), text);
    }

    #[test]
    fn test_nested_fragment_is_byte_identical() {
        let text = "{v=Core::BooleanValue(Value='false'),sub={n=Core::BooleanNot(inValue=parent.inFlag),outNeg=n.outValue}(inFlag=v.outValue),outResult=sub.outNeg}";
        assert_eq!(serialize(&parse(text).unwrap()), text);
    }

    #[test]
    fn test_inline_sources_are_written_by_name() {
        let net = parse("{outResult=Core::BooleanNot(inValue=Core::BooleanValue(Value='true').outValue).outValue}").unwrap();
        assert_eq!(
            net.to_string(),
            "{p0=Core::BooleanValue(Value='true'),p1=Core::BooleanNot(inValue=p0.outValue),outResult=p1.outValue}"
        );
    }

    #[test]
    fn test_ports_precede_parameters() {
        let net = parse("{a=Core::Value(),b=Core::Scale(Factor='2',inValue[0.5]=a.outValue)}").unwrap();
        assert_eq!(
            serialize(&net),
            "{a=Core::Value(),b=Core::Scale(inValue[0.5]=a.outValue,Factor='2')}"
        );
    }

    #[test]
    fn test_omits_unset_parameters_and_open_ports() {
        let mut net = Fragment::new();
        let mut primitive = Primitive::new("Core::DoubleValue").unwrap();
        primitive.declare_param("Unit").unwrap();
        primitive.declare_in_port("inReset").unwrap();
        primitive.set_param("Value", "3").unwrap();
        net.add_named("value", primitive).unwrap();
        assert_eq!(serialize(&net), "{value=Core::DoubleValue(Value='3')}");
        assert_eq!(serialize(&Fragment::new()), "{}");
    }

    #[test]
    fn test_removed_child_is_not_written() {
        let mut net = parse("{a=Core::Value(),b=Core::Value()}").unwrap();
        let a = net.find("a").unwrap();
        net.remove(a).unwrap();
        assert_eq!(serialize(&net), "{b=Core::Value()}");
    }

    #[test]
    fn test_unconsumed_input_is_not_written() {
        let mut net = parse("{not=Core::BooleanNot(inValue=parent.inFlag)}").unwrap();
        net.add_input("inIdle").unwrap();
        assert_eq!(serialize(&net), "{not=Core::BooleanNot(inValue=parent.inFlag)}");
        assert_eq!(net.validate(), vec!["inIdle is never consumed"]);
    }

    const TYPES: [&str; 4] = [
        "Core::DoubleAdd",
        "Core::BooleanNot",
        "Core::DoubleValue",
        "Core::DoubleNetcommOut",
    ];
    const VALUES: [&str; 5] = ["1.5", "speed", "[1,2]", "{x:1}", ""];
    const RETENTIONS: [f64; 3] = [0.5, 2.0, 10.25];

    fn random_net(rng: &mut StdRng) -> Fragment {
        let mut net = Fragment::new();
        let count = rng.gen_range(0..6);
        let mut ids = Vec::new();
        for index in 0..count {
            let mut primitive = Primitive::new(TYPES[rng.gen_range(0..TYPES.len())]).unwrap();
            for param in 0..rng.gen_range(0..3) {
                let value = VALUES[rng.gen_range(0..VALUES.len())];
                primitive.set_param(&format!("P{}", param), value).unwrap();
            }
            let id = if rng.gen_bool(0.3) {
                net.add(primitive)
            } else {
                net.add_named(&format!("n{}", index), primitive).unwrap()
            };
            ids.push(id);
        }
        for &target in &ids {
            for port in 0..rng.gen_range(0..3) {
                let source = if rng.gen_bool(0.25) {
                    net.add_input(&format!("in{}", rng.gen_range(0..3))).unwrap()
                } else {
                    let owner = ids[rng.gen_range(0..ids.len())];
                    net.out_port(owner, if rng.gen_bool(0.5) { "outValue" } else { "outFlag" })
                        .unwrap()
                };
                let name = format!("in{}", (b'A' + port as u8) as char);
                net.connect(target, &name, source).unwrap();
                if rng.gen_bool(0.3) {
                    let seconds = RETENTIONS[rng.gen_range(0..RETENTIONS.len())];
                    net.set_debug_retention(target, &name, Some(seconds)).unwrap();
                }
            }
        }
        if !ids.is_empty() {
            for output in 0..rng.gen_range(0..3) {
                let owner = ids[rng.gen_range(0..ids.len())];
                let source = net.out_port(owner, "outValue").unwrap();
                net.add_output(&format!("out{}", output), source).unwrap();
            }
        }
        net
    }

    #[test]
    fn test_random_nets_round_trip() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..200 {
            let net = random_net(&mut rng);
            let text = serialize(&net);
            let reparsed = parse(&text).unwrap_or_else(|e| panic!("{}: {}", text, e));
            assert_eq!(serialize(&reparsed), text);
            assert!(net.validate().is_empty(), "{}", text);
            assert_eq!(reparsed.len(), net.len());
            assert_eq!(reparsed.input_names(), net.input_names());
            assert_eq!(reparsed.output_names(), net.output_names());
            for ((_, original), (_, parsed)) in net.children().zip(reparsed.children()) {
                assert_eq!(original.name(), parsed.name());
                assert_eq!(
                    original.as_primitive().map(|p| p.type_name()),
                    parsed.as_primitive().map(|p| p.type_name())
                );
                assert_eq!(original.in_ports().len(), parsed.in_ports().len(), "{}", text);
                for (before, after) in original.in_ports().iter().zip(parsed.in_ports()) {
                    assert_eq!(before.name(), after.name());
                    assert_eq!(
                        before.source().and_then(|s| net.describe_source(s)),
                        after.source().and_then(|s| reparsed.describe_source(s))
                    );
                    assert_eq!(before.debug_retention(), after.debug_retention());
                }
            }
        }
    }
}
