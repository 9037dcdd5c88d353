//! Wire text parser
//!
//! Parsing runs in two passes. The scanner turns the text into a syntax tree
//! and fails with [`RccError::Format`] at the first byte that does not fit the
//! grammar. The builder then materializes every primitive of a fragment
//! (named children and inline sources alike) before it resolves any wiring,
//! so a primitive may reference one defined later in the same fragment.
//! Resolution failures are reported as [`RccError::Resolve`] naming the
//! binding they occurred in. Nothing is returned unless both passes succeed.
//! Fragments and parameter lists nest at most [`MAX_NESTING`] levels deep.
//!
//! ```text
//! fragment := '{' [binding (',' binding)*] '}'
//! binding  := name '=' value ['.' port]
//! value    := type '(' [param (',' param)*] ')' | fragment ['(' params ')'] | name | 'parent'
//! param    := name ['[' seconds ']'] '=' ("'" text "'" | value '.' port)
//! ```

use crate::config::CoreConfig;
use crate::net::{is_identifier, Fragment, OutPortRef, PrimitiveCatalog, PrimitiveId, PARENT};
use crate::{Result, RccError};
use std::collections::HashSet;

/// Deepest allowed nesting of fragments and parameter lists
pub const MAX_NESTING: usize = 64;

#[derive(Debug)]
struct FragmentSyntax {
    bindings: Vec<BindingSyntax>,
    args: Vec<ParamSyntax>,
}

#[derive(Debug)]
struct BindingSyntax {
    name: String,
    value: ValueSyntax,
    port: Option<String>,
}

#[derive(Debug)]
enum ValueSyntax {
    Primitive { type_name: String, params: Vec<ParamSyntax> },
    Fragment(FragmentSyntax),
    Reference(String),
}

#[derive(Debug)]
struct ParamSyntax {
    name: String,
    debug: Option<f64>,
    value: ParamValue,
}

#[derive(Debug)]
enum ParamValue {
    Quoted(String),
    Port { target: ValueSyntax, port: String },
}

struct Scanner<'a> {
    text: &'a str,
    pos: usize,
    depth: usize,
}

impl<'a> Scanner<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            pos: 0,
            depth: 0,
        }
    }

    /// Run `parse` one nesting level deeper
    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.depth >= MAX_NESTING {
            return Err(RccError::format(
                self.pos,
                format!("Net is nested deeper than {} levels", MAX_NESTING),
            ));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn found(&self) -> String {
        match self.peek() {
            Some(c) => format!("'{}'", c),
            None => "end of input".to_string(),
        }
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.pos += expected.len_utf8();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: char) -> Result<()> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(RccError::format(
                self.pos,
                format!("Expected '{}' but found {}", expected, self.found()),
            ))
        }
    }

    fn take_while(&mut self, accept: impl Fn(char) -> bool) -> &'a str {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if !accept(c) {
                break;
            }
            self.pos += c.len_utf8();
        }
        &self.text[start..self.pos]
    }

    fn identifier(&mut self, what: &str) -> Result<String> {
        let token = self.take_while(|c| c.is_ascii_alphanumeric() || c == '_');
        if token.is_empty() {
            return Err(RccError::format(
                self.pos,
                format!("Expected {} but found {}", what, self.found()),
            ));
        }
        Ok(token.to_string())
    }

    fn fragment(&mut self) -> Result<FragmentSyntax> {
        self.expect('{')?;
        let mut bindings = Vec::new();
        if !self.eat('}') {
            loop {
                bindings.push(self.binding()?);
                if self.eat('}') {
                    break;
                }
                if !self.eat(',') {
                    return Err(RccError::format(
                        self.pos,
                        format!("Expected ',' or '}}' but found {}", self.found()),
                    ));
                }
            }
        }
        Ok(FragmentSyntax {
            bindings,
            args: Vec::new(),
        })
    }

    fn binding(&mut self) -> Result<BindingSyntax> {
        let name = self.identifier("binding name")?;
        self.expect('=')?;
        let value = self.value()?;
        let port = if self.eat('.') {
            Some(self.identifier("port name")?)
        } else {
            None
        };
        Ok(BindingSyntax { name, value, port })
    }

    fn value(&mut self) -> Result<ValueSyntax> {
        if self.peek() == Some('{') {
            let mut fragment = self.nested(Self::fragment)?;
            if self.eat('(') {
                fragment.args = self.nested(Self::params)?;
            }
            return Ok(ValueSyntax::Fragment(fragment));
        }
        let start = self.pos;
        let token = self.take_while(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':');
        if token.is_empty() {
            return Err(RccError::format(
                self.pos,
                format!("Expected primitive, fragment or reference but found {}", self.found()),
            ));
        }
        if self.eat('(') {
            let params = self.nested(Self::params)?;
            return Ok(ValueSyntax::Primitive {
                type_name: token.to_string(),
                params,
            });
        }
        if !is_identifier(token) {
            return Err(RccError::format(
                start,
                format!("Type '{}' must be followed by '('", token),
            ));
        }
        Ok(ValueSyntax::Reference(token.to_string()))
    }

    /// Parameter list after the opening parenthesis, closing parenthesis included
    fn params(&mut self) -> Result<Vec<ParamSyntax>> {
        let mut params = Vec::new();
        if self.eat(')') {
            return Ok(params);
        }
        loop {
            params.push(self.param()?);
            if self.eat(')') {
                return Ok(params);
            }
            if !self.eat(',') {
                return Err(RccError::format(
                    self.pos,
                    format!("Expected ',' or ')' but found {}", self.found()),
                ));
            }
        }
    }

    fn param(&mut self) -> Result<ParamSyntax> {
        let name = self.identifier("parameter name")?;
        let debug = if self.eat('[') {
            let start = self.pos;
            let number = self.take_while(|c| c.is_ascii_digit() || c == '.');
            let seconds = number.parse::<f64>().map_err(|_| {
                RccError::format(start, format!("Invalid debug retention '{}'", number))
            })?;
            self.expect(']')?;
            Some(seconds)
        } else {
            None
        };
        self.expect('=')?;
        let value = if self.eat('\'') {
            let text = self.take_while(|c| c != '\'');
            self.expect('\'')?;
            ParamValue::Quoted(text.to_string())
        } else {
            let target = self.value()?;
            self.expect('.')?;
            let port = self.identifier("port name")?;
            ParamValue::Port { target, port }
        };
        Ok(ParamSyntax { name, debug, value })
    }
}

/// A source known by name only until the whole fragment is materialized
enum PendingSource {
    Named { name: String, port: String },
    Parent { port: String },
    Node { id: PrimitiveId, port: String },
}

struct PendingWire {
    binding: String,
    target: PrimitiveId,
    in_port: String,
    debug: Option<f64>,
    source: PendingSource,
}

fn at(binding: &str) -> impl Fn(RccError) -> RccError + '_ {
    move |e| match e {
        RccError::Resolve { .. } | RccError::Format { .. } => e,
        other => RccError::resolve(binding, other.to_string()),
    }
}

/// Parser for the net wire text
#[derive(Debug, Clone)]
pub struct NetParser {
    catalog: PrimitiveCatalog,
    prefix: String,
}

impl Default for NetParser {
    fn default() -> Self {
        Self::new()
    }
}

impl NetParser {
    pub fn new() -> Self {
        Self {
            catalog: PrimitiveCatalog::with_defaults(),
            prefix: "p".to_string(),
        }
    }

    pub fn from_config(config: &CoreConfig) -> Self {
        Self {
            catalog: PrimitiveCatalog::with_defaults(),
            prefix: config.anonymous_prefix().to_string(),
        }
    }

    pub fn with_catalog(mut self, catalog: PrimitiveCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn parse(&self, text: &str) -> Result<Fragment> {
        let mut scanner = Scanner::new(text);
        let syntax = scanner.fragment()?;
        if scanner.pos != text.len() {
            return Err(RccError::format(
                scanner.pos,
                format!("Unexpected {} after net", scanner.found()),
            ));
        }
        self.build_fragment(&syntax)
    }

    fn build_fragment(&self, syntax: &FragmentSyntax) -> Result<Fragment> {
        let mut fragment = Fragment::with_prefix(&self.prefix);
        for binding in syntax.bindings.iter().filter(|b| b.port.is_none()) {
            fragment.reserve_name(&binding.name);
        }

        let mut wires = Vec::new();
        let mut exports = Vec::new();
        for binding in &syntax.bindings {
            let name = binding.name.as_str();
            match (&binding.port, &binding.value) {
                (None, ValueSyntax::Reference(target)) => {
                    return Err(RccError::resolve(
                        name,
                        format!("Reference '{}' must name a port", target),
                    ));
                }
                (None, ValueSyntax::Primitive { type_name, params }) => {
                    self.materialize_primitive(&mut fragment, Some(name), type_name, params, name, &mut wires)?;
                }
                (None, ValueSyntax::Fragment(inner)) => {
                    self.materialize_fragment(&mut fragment, Some(name), inner, name, &mut wires)?;
                }
                (Some(port), value) => {
                    let source = self.materialize_source(&mut fragment, value, port, name, &mut wires)?;
                    exports.push((name, source));
                }
            }
        }

        for wire in wires {
            let source = Self::resolve(&mut fragment, &wire.source, &wire.binding)?;
            fragment
                .connect(wire.target, &wire.in_port, source)
                .map_err(at(&wire.binding))?;
            if wire.debug.is_some() {
                fragment
                    .set_debug_retention(wire.target, &wire.in_port, wire.debug)
                    .map_err(at(&wire.binding))?;
            }
        }
        for (name, source) in exports {
            let source = Self::resolve(&mut fragment, &source, name)?;
            fragment.add_output(name, source).map_err(at(name))?;
        }
        Ok(fragment)
    }

    fn materialize_primitive(
        &self,
        fragment: &mut Fragment,
        name: Option<&str>,
        type_name: &str,
        params: &[ParamSyntax],
        binding: &str,
        wires: &mut Vec<PendingWire>,
    ) -> Result<PrimitiveId> {
        let mut primitive = self.catalog.instantiate(type_name).map_err(at(binding))?;
        let mut seen = HashSet::new();
        let mut connections = Vec::new();
        for param in params {
            if !seen.insert(param.name.as_str()) {
                return Err(RccError::resolve(
                    binding,
                    format!("'{}' is given twice for {}", param.name, type_name),
                ));
            }
            match &param.value {
                ParamValue::Quoted(text) => {
                    if param.debug.is_some() {
                        return Err(RccError::resolve(
                            binding,
                            format!("Parameter '{}' cannot carry a debug retention", param.name),
                        ));
                    }
                    primitive.set_param(&param.name, text.as_str()).map_err(at(binding))?;
                }
                ParamValue::Port { target, port } => {
                    let source = self.materialize_source(fragment, target, port, binding, wires)?;
                    connections.push((param, source));
                }
            }
        }

        let id = match name {
            Some(name) => fragment.add_named(name, primitive).map_err(at(binding))?,
            None => fragment.add(primitive),
        };
        for (param, source) in connections {
            wires.push(PendingWire {
                binding: binding.to_string(),
                target: id,
                in_port: param.name.clone(),
                debug: param.debug,
                source,
            });
        }
        Ok(id)
    }

    fn materialize_fragment(
        &self,
        fragment: &mut Fragment,
        name: Option<&str>,
        syntax: &FragmentSyntax,
        binding: &str,
        wires: &mut Vec<PendingWire>,
    ) -> Result<PrimitiveId> {
        let inner = self.build_fragment(syntax)?;
        let mut connections = Vec::new();
        for arg in &syntax.args {
            match &arg.value {
                ParamValue::Quoted(_) => {
                    return Err(RccError::resolve(
                        binding,
                        format!("Fragment input '{}' must be connected to a port", arg.name),
                    ));
                }
                ParamValue::Port { target, port } => {
                    let source = self.materialize_source(fragment, target, port, binding, wires)?;
                    connections.push((arg, source));
                }
            }
        }

        let id = match name {
            Some(name) => fragment.add_named(name, inner).map_err(at(binding))?,
            None => fragment.add(inner),
        };
        for (arg, source) in connections {
            wires.push(PendingWire {
                binding: binding.to_string(),
                target: id,
                in_port: arg.name.clone(),
                debug: arg.debug,
                source,
            });
        }
        Ok(id)
    }

    fn materialize_source(
        &self,
        fragment: &mut Fragment,
        target: &ValueSyntax,
        port: &str,
        binding: &str,
        wires: &mut Vec<PendingWire>,
    ) -> Result<PendingSource> {
        let port = port.to_string();
        Ok(match target {
            ValueSyntax::Reference(name) if name == PARENT => PendingSource::Parent { port },
            ValueSyntax::Reference(name) => PendingSource::Named {
                name: name.clone(),
                port,
            },
            ValueSyntax::Primitive { type_name, params } => {
                let id = self.materialize_primitive(fragment, None, type_name, params, binding, wires)?;
                PendingSource::Node { id, port }
            }
            ValueSyntax::Fragment(inner) => {
                let id = self.materialize_fragment(fragment, None, inner, binding, wires)?;
                PendingSource::Node { id, port }
            }
        })
    }

    fn resolve(fragment: &mut Fragment, source: &PendingSource, binding: &str) -> Result<OutPortRef> {
        match source {
            PendingSource::Parent { port } => fragment.add_input(port).map_err(at(binding)),
            PendingSource::Named { name, port } => {
                let id = fragment.find(name).ok_or_else(|| {
                    RccError::resolve(binding, format!("Unknown primitive '{}'", name))
                })?;
                fragment.out_port(id, port).map_err(at(binding))
            }
            PendingSource::Node { id, port } => fragment.out_port(*id, port).map_err(at(binding)),
        }
    }
}

/// Parse net text with the default catalogue
pub fn parse(text: &str) -> Result<Fragment> {
    NetParser::new().parse(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{NodeKind, PortOwner};

    #[test]
    fn test_parse_simple_net() {
        let net = parse("{a=Core::DoubleValue(Value='2.5'),outValue=a.outValue}").unwrap();
        assert_eq!(net.len(), 1);
        let a = net.find("a").unwrap();
        let node = net.get(a).unwrap();
        assert_eq!(node.as_primitive().unwrap().type_name(), "Core::DoubleValue");
        assert_eq!(node.as_primitive().unwrap().param("Value"), Some("2.5"));
        assert_eq!(net.output_names(), vec!["outValue"]);
        assert!(net.input_names().is_empty());
    }

    #[test]
    fn test_forward_reference_resolves() {
        let net = parse("{sum=Core::DoubleAdd(inFirst=a.outValue,inSecond=b.outValue),a=Core::DoubleValue(Value='1'),b=Core::DoubleValue(Value='2')}").unwrap();
        let sum = net.get(net.find("sum").unwrap()).unwrap();
        let first = sum.in_ports()[0].source().unwrap();
        assert_eq!(net.describe_source(first), Some(("a", "outValue")));
        let second = sum.in_ports()[1].source().unwrap();
        assert_eq!(net.describe_source(second), Some(("b", "outValue")));
    }

    #[test]
    fn test_parent_reference_creates_input() {
        let net = parse("{add=Core::Add(first=parent.ina,second='1.0'),outResult=add.outValue}").unwrap();
        assert_eq!(net.input_names(), vec!["ina"]);
        assert_eq!(net.output_names(), vec!["outResult"]);
        let add = net.get(net.find("add").unwrap()).unwrap();
        assert_eq!(add.in_ports()[0].source().unwrap().owner(), PortOwner::Boundary);
    }

    #[test]
    fn test_inline_primitive_is_anonymous() {
        let net = parse("{outResult=Core::BooleanNot(inValue=Core::BooleanValue(Value='true').outValue).outValue}").unwrap();
        let names: Vec<&str> = net.children().map(|(_, n)| n.name()).collect();
        // sources are inserted ahead of their consumer
        assert_eq!(names, vec!["p0", "p1"]);
        assert_eq!(net.get(net.find("p1").unwrap()).unwrap().as_primitive().unwrap().type_name(), "Core::BooleanNot");
    }

    #[test]
    fn test_inline_names_skip_explicit_names() {
        let net = parse("{x=Core::Not(inValue=Core::Value().outValue),p0=Core::Value()}").unwrap();
        let names: Vec<&str> = net.children().map(|(_, n)| n.name()).collect();
        assert_eq!(names, vec!["p1", "x", "p0"]);
    }

    #[test]
    fn test_nested_fragment_with_connected_inputs() {
        let text = "{v=Core::BooleanValue(Value='false'),sub={n=Core::BooleanNot(inValue=parent.inFlag),outNeg=n.outValue}(inFlag=v.outValue),outResult=sub.outNeg}";
        let net = parse(text).unwrap();
        let sub = net.get(net.find("sub").unwrap()).unwrap();
        assert_eq!(sub.kind(), NodeKind::Fragment);
        let inner = sub.as_fragment().unwrap();
        assert_eq!(inner.input_names(), vec!["inFlag"]);
        assert_eq!(inner.output_names(), vec!["outNeg"]);
        let source = sub.in_ports()[0].source().unwrap();
        assert_eq!(net.describe_source(source), Some(("v", "outValue")));
    }

    #[test]
    fn test_deep_nesting_is_a_format_error() {
        let fragments = "{a=".repeat(200_000);
        assert!(matches!(parse(&fragments), Err(RccError::Format { .. })));

        let primitives = format!("{{a={}", "Core::Not(inValue=".repeat(200_000));
        match parse(&primitives) {
            Err(RccError::Format { message, .. }) => assert!(message.contains("nested deeper")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_moderate_nesting_parses() {
        let text = format!("{}{{}}{}", "{a=".repeat(20), "}".repeat(20));
        let mut net = parse(&text).unwrap();
        for _ in 0..20 {
            let a = net.find("a").unwrap();
            net = net.get(a).unwrap().as_fragment().unwrap().clone();
        }
        assert!(net.is_empty());

        let mut source = "Core::Value()".to_string();
        for _ in 0..20 {
            source = format!("Core::Not(inValue={}.outValue)", source);
        }
        let net = parse(&format!("{{a={}}}", source)).unwrap();
        assert_eq!(net.len(), 21);
    }

    #[test]
    fn test_debug_retention_parsed() {
        let net = parse("{a=Core::Value(),b=Core::Sink(inValue[2.5]=a.outValue)}").unwrap();
        let b = net.get(net.find("b").unwrap()).unwrap();
        assert_eq!(b.in_ports()[0].debug_retention(), Some(2.5));
    }

    #[test]
    fn test_netcomm_classified_by_catalog() {
        let net = parse("{k=Core::DoubleNetcommOut(Key='speed')}").unwrap();
        let k = net.get(net.find("k").unwrap()).unwrap();
        assert_eq!(k.kind(), NodeKind::Netcomm);
        assert_eq!(net.netcomm_keys(), vec!["speed".to_string()]);
    }

    #[test]
    fn test_empty_fragment() {
        let net = parse("{}").unwrap();
        assert!(net.is_empty());
    }

    #[test]
    fn test_format_errors_carry_position() {
        match parse("{a=Core::Value(}") {
            Err(RccError::Format { position, .. }) => assert_eq!(position, 15),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(matches!(parse("{a=Core::Value()"), Err(RccError::Format { .. })));
        assert!(matches!(parse("{a=Core::Value()]"), Err(RccError::Format { .. })));
        assert!(matches!(parse("{a=Core::Value()}x"), Err(RccError::Format { .. })));
        assert!(matches!(parse("{a = Core::Value()}"), Err(RccError::Format { .. })));
        assert!(matches!(parse("{a=Core::Value(v='x)}"), Err(RccError::Format { .. })));
        assert!(matches!(parse("{a=Core::Value}"), Err(RccError::Format { .. })));
    }

    #[test]
    fn test_resolution_errors_name_the_binding() {
        match parse("{a=Core::Sink(inValue=missing.outValue)}") {
            Err(RccError::Resolve { binding, .. }) => assert_eq!(binding, "a"),
            other => panic!("unexpected result: {:?}", other),
        }
        match parse("{a=Core::Value(),result=a.outValue}") {
            Err(RccError::Resolve { binding, .. }) => assert_eq!(binding, "result"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(matches!(parse("{a=Core::Value(),a=Core::Value()}"), Err(RccError::Resolve { .. })));
        assert!(matches!(parse("{a=b}"), Err(RccError::Resolve { .. })));
        assert!(matches!(parse("{a=Core::Sink(inValue=parent.value)}"), Err(RccError::Resolve { .. })));
        assert!(matches!(parse("{a=Core::Sink(x='1',x='2')}"), Err(RccError::Resolve { .. })));
    }
}
