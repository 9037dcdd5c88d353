//! Net graph: primitives, ports and fragments
//!
//! A [`Fragment`] is an arena of child nodes. Children are addressed by
//! [`PrimitiveId`] and value sources by [`OutPortRef`]; both carry the key of
//! the fragment that issued them, so a reference handed to the wrong fragment
//! is rejected instead of silently wiring an unrelated node.
//!
//! All sources a fragment can wire are local to it: an out-port of one of its
//! children, or the inside of one of its own boundary inputs. A nested
//! fragment's boundary inputs are connected from the enclosing fragment, like
//! the in-ports of any other child.
//!
//! Removing a child leaves a tombstone. Dependents keep their references to it
//! until the caller disconnects them ([`Fragment::disconnect_dependents`]).

use crate::value::{Value, ValueType};
use crate::{Result, RccError};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Reserved reference name for a fragment's own boundary inputs
pub const PARENT: &str = "parent";

pub(crate) fn is_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub(crate) fn is_type_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

fn check_port_name(name: &str) -> Result<()> {
    if !is_identifier(name) {
        return Err(RccError::Naming(format!("Invalid port name '{}'", name)));
    }
    Ok(())
}

fn check_boundary_name(name: &str, prefix: &str) -> Result<()> {
    if !name.starts_with(prefix) || name.contains('.') || !is_identifier(name) {
        return Err(RccError::Naming(format!(
            "Fragment port '{}' must start with '{}' and be a plain identifier",
            name, prefix
        )));
    }
    Ok(())
}

/// Identity of one fragment arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentKey(Uuid);

/// A child of a fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PrimitiveId {
    fragment: FragmentKey,
    index: usize,
}

impl PrimitiveId {
    pub fn index(&self) -> usize {
        self.index
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortOwner {
    /// Out-port of a child (for a nested fragment: one of its boundary outputs)
    Child(usize),
    /// Inside of one of the fragment's own boundary inputs
    Boundary,
}

/// A value source inside one fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutPortRef {
    fragment: FragmentKey,
    owner: PortOwner,
    port: usize,
}

impl OutPortRef {
    pub fn owner(&self) -> PortOwner {
        self.owner
    }

    pub fn port(&self) -> usize {
        self.port
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutPort {
    name: String,
}

impl OutPort {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A value sink holding at most one source
#[derive(Debug, Clone, PartialEq)]
pub struct InPort {
    name: String,
    source: Option<OutPortRef>,
    debug_retention: Option<f64>,
}

impl InPort {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            source: None,
            debug_retention: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> Option<OutPortRef> {
        self.source
    }

    /// Seconds of value history the control core keeps for diagnostics
    pub fn debug_retention(&self) -> Option<f64> {
        self.debug_retention
    }

    /// Connecting again to the current source is a no-op
    fn connect_to(&mut self, source: OutPortRef) -> Result<()> {
        match self.source {
            None => {
                self.source = Some(source);
                Ok(())
            }
            Some(existing) if existing == source => Ok(()),
            Some(_) => Err(RccError::Connection(format!(
                "In-port '{}' is already connected to a different source",
                self.name
            ))),
        }
    }

    fn set_debug_retention(&mut self, seconds: Option<f64>) -> Result<()> {
        if let Some(s) = seconds {
            if !(s >= 0.0) || !s.is_finite() {
                return Err(RccError::Connection(format!(
                    "Debug retention for '{}' must be a non-negative number of seconds",
                    self.name
                )));
            }
        }
        self.debug_retention = seconds;
        Ok(())
    }
}

/// Compile-time constant parameter of a primitive
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    name: String,
    value: Option<String>,
}

impl Parameter {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimitiveKind {
    Leaf,
    /// Exchanges a value with the outside world under the key held in `key_param`
    Netcomm { key_param: String },
}

/// A leaf node of the net
#[derive(Debug, Clone, PartialEq)]
pub struct Primitive {
    type_name: String,
    kind: PrimitiveKind,
    in_ports: Vec<InPort>,
    out_ports: Vec<OutPort>,
    parameters: Vec<Parameter>,
}

impl Primitive {
    pub fn new(type_name: &str) -> Result<Self> {
        Self::with_kind(type_name, PrimitiveKind::Leaf)
    }

    pub fn netcomm(type_name: &str, key_param: &str) -> Result<Self> {
        Self::with_kind(
            type_name,
            PrimitiveKind::Netcomm {
                key_param: key_param.to_string(),
            },
        )
    }

    pub fn with_kind(type_name: &str, kind: PrimitiveKind) -> Result<Self> {
        if !is_type_name(type_name) {
            return Err(RccError::Naming(format!("Invalid primitive type '{}'", type_name)));
        }
        Ok(Self {
            type_name: type_name.to_string(),
            kind,
            in_ports: Vec::new(),
            out_ports: Vec::new(),
            parameters: Vec::new(),
        })
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn kind(&self) -> &PrimitiveKind {
        &self.kind
    }

    pub fn in_ports(&self) -> &[InPort] {
        &self.in_ports
    }

    pub fn out_ports(&self) -> &[OutPort] {
        &self.out_ports
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn in_port(&self, name: &str) -> Option<&InPort> {
        self.in_ports.iter().find(|p| p.name == name)
    }

    pub fn out_port_index(&self, name: &str) -> Option<usize> {
        self.out_ports.iter().position(|p| p.name == name)
    }

    pub fn declare_in_port(&mut self, name: &str) -> Result<()> {
        self.in_port_index_or_create(name).map(|_| ())
    }

    pub fn declare_out_port(&mut self, name: &str) -> Result<usize> {
        if let Some(index) = self.out_port_index(name) {
            return Ok(index);
        }
        check_port_name(name)?;
        self.out_ports.push(OutPort {
            name: name.to_string(),
        });
        Ok(self.out_ports.len() - 1)
    }

    fn in_port_index_or_create(&mut self, name: &str) -> Result<usize> {
        if let Some(index) = self.in_ports.iter().position(|p| p.name == name) {
            return Ok(index);
        }
        check_port_name(name)?;
        self.in_ports.push(InPort::new(name));
        Ok(self.in_ports.len() - 1)
    }

    /// Declare a parameter without a value; it is left out of the wire text
    pub fn declare_param(&mut self, name: &str) -> Result<()> {
        check_port_name(name)?;
        if !self.parameters.iter().any(|p| p.name == name) {
            self.parameters.push(Parameter {
                name: name.to_string(),
                value: None,
            });
        }
        Ok(())
    }

    pub fn set_param(&mut self, name: &str, value: impl Into<String>) -> Result<()> {
        let value = value.into();
        check_port_name(name)?;
        if value.contains('\'') {
            return Err(RccError::Naming(format!(
                "Parameter '{}' value must not contain a quote",
                name
            )));
        }
        match self.parameters.iter_mut().find(|p| p.name == name) {
            Some(param) => param.value = Some(value),
            None => self.parameters.push(Parameter {
                name: name.to_string(),
                value: Some(value),
            }),
        }
        Ok(())
    }

    pub fn with_param(mut self, name: &str, value: impl Into<String>) -> Result<Self> {
        self.set_param(name, value)?;
        Ok(self)
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .and_then(|p| p.value.as_deref())
    }

    /// Store a typed value as the parameter's text
    pub fn set_value(&mut self, name: &str, value: &Value) -> Result<()> {
        self.set_param(name, value.to_text())
    }

    pub fn value_param(&self, name: &str, value_type: &ValueType) -> Result<Option<Value>> {
        self.param(name).map(|text| value_type.parse(text)).transpose()
    }

    /// Netcomm key, when this primitive exchanges values with the outside
    pub fn netcomm_key(&self) -> Option<&str> {
        match &self.kind {
            PrimitiveKind::Netcomm { key_param } => self.param(key_param),
            PrimitiveKind::Leaf => None,
        }
    }
}

/// Closed set of node variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Leaf,
    Netcomm,
    Fragment,
}

impl NodeKind {
    pub fn is_container(&self) -> bool {
        matches!(self, NodeKind::Fragment)
    }
}

#[derive(Debug, Clone)]
pub enum NodeBody {
    Primitive(Primitive),
    Fragment(Fragment),
}

impl From<Primitive> for NodeBody {
    fn from(p: Primitive) -> Self {
        NodeBody::Primitive(p)
    }
}

impl From<Fragment> for NodeBody {
    fn from(f: Fragment) -> Self {
        NodeBody::Fragment(f)
    }
}

/// A named child of a fragment
#[derive(Debug, Clone)]
pub struct Node {
    name: String,
    body: NodeBody,
}

impl Node {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn body(&self) -> &NodeBody {
        &self.body
    }

    pub fn kind(&self) -> NodeKind {
        match &self.body {
            NodeBody::Fragment(_) => NodeKind::Fragment,
            NodeBody::Primitive(p) => match p.kind {
                PrimitiveKind::Leaf => NodeKind::Leaf,
                PrimitiveKind::Netcomm { .. } => NodeKind::Netcomm,
            },
        }
    }

    pub fn as_primitive(&self) -> Option<&Primitive> {
        match &self.body {
            NodeBody::Primitive(p) => Some(p),
            NodeBody::Fragment(_) => None,
        }
    }

    pub fn as_fragment(&self) -> Option<&Fragment> {
        match &self.body {
            NodeBody::Fragment(f) => Some(f),
            NodeBody::Primitive(_) => None,
        }
    }

    /// In-ports as seen from the enclosing fragment
    pub fn in_ports(&self) -> &[InPort] {
        match &self.body {
            NodeBody::Primitive(p) => &p.in_ports,
            NodeBody::Fragment(f) => &f.inputs,
        }
    }

    fn out_port_count(&self) -> usize {
        match &self.body {
            NodeBody::Primitive(p) => p.out_ports.len(),
            NodeBody::Fragment(f) => f.outputs.len(),
        }
    }

    pub fn out_port_name(&self, index: usize) -> Option<&str> {
        match &self.body {
            NodeBody::Primitive(p) => p.out_ports.get(index).map(|o| o.name.as_str()),
            NodeBody::Fragment(f) => f.outputs.get(index).map(|o| o.name.as_str()),
        }
    }
}

/// Re-export of an inner source as the fragment's own output
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentOutPort {
    name: String,
    source: OutPortRef,
}

impl FragmentOutPort {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> OutPortRef {
        self.source
    }
}

#[derive(Debug, Clone)]
struct Slot {
    node: Node,
    removed: bool,
}

#[derive(Debug, Clone)]
struct Namer {
    prefix: String,
    next: usize,
    reserved: HashSet<String>,
}

/// Composite node owning an ordered set of children and a named boundary
#[derive(Debug)]
pub struct Fragment {
    key: FragmentKey,
    slots: Vec<Slot>,
    /// Boundary inputs; the in-port side faces the enclosing fragment
    inputs: Vec<InPort>,
    outputs: Vec<FragmentOutPort>,
    namer: Namer,
}

/// A clone is a new arena: it gets its own key, and ids and port refs taken
/// from the original are rejected by it.
impl Clone for Fragment {
    fn clone(&self) -> Self {
        let key = FragmentKey(Uuid::new_v4());
        let rekey = |source: &mut OutPortRef| {
            if source.fragment == self.key {
                source.fragment = key;
            }
        };
        // nested fragments rekey their own arenas as they are cloned
        let mut slots = self.slots.clone();
        for slot in &mut slots {
            let ports = match &mut slot.node.body {
                NodeBody::Primitive(p) => &mut p.in_ports,
                NodeBody::Fragment(f) => &mut f.inputs,
            };
            ports.iter_mut().filter_map(|p| p.source.as_mut()).for_each(rekey);
        }
        let mut outputs = self.outputs.clone();
        outputs.iter_mut().for_each(|o| rekey(&mut o.source));
        Self {
            key,
            slots,
            inputs: self.inputs.clone(),
            outputs,
            namer: self.namer.clone(),
        }
    }
}

impl Default for Fragment {
    fn default() -> Self {
        Self::new()
    }
}

impl Fragment {
    pub fn new() -> Self {
        Self::with_prefix("p")
    }

    /// Fragment whose anonymous children are named `<prefix><n>`
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            key: FragmentKey(Uuid::new_v4()),
            slots: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            namer: Namer {
                prefix: prefix.to_string(),
                next: 0,
                reserved: HashSet::new(),
            },
        }
    }

    /// Keep `name` free for an explicit child added later
    pub(crate) fn reserve_name(&mut self, name: &str) {
        self.namer.reserved.insert(name.to_string());
    }

    fn id(&self, index: usize) -> PrimitiveId {
        PrimitiveId {
            fragment: self.key,
            index,
        }
    }

    fn live_index(&self, name: &str) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| !s.removed && s.node.name == name)
    }

    fn next_anonymous_name(&mut self) -> String {
        loop {
            let candidate = format!("{}{}", self.namer.prefix, self.namer.next);
            self.namer.next += 1;
            if self.live_index(&candidate).is_none() && !self.namer.reserved.contains(&candidate) {
                return candidate;
            }
        }
    }

    /// Insert a child under a generated name
    pub fn add(&mut self, body: impl Into<NodeBody>) -> PrimitiveId {
        let name = self.next_anonymous_name();
        self.push(name, body.into())
    }

    pub fn add_named(&mut self, name: &str, body: impl Into<NodeBody>) -> Result<PrimitiveId> {
        if !is_identifier(name) || name == PARENT {
            return Err(RccError::Naming(format!("Invalid primitive name '{}'", name)));
        }
        if self.live_index(name).is_some() {
            return Err(RccError::Naming(format!("Duplicate primitive name '{}'", name)));
        }
        self.namer.reserved.remove(name);
        Ok(self.push(name.to_string(), body.into()))
    }

    fn push(&mut self, name: String, body: NodeBody) -> PrimitiveId {
        self.slots.push(Slot {
            node: Node { name, body },
            removed: false,
        });
        self.id(self.slots.len() - 1)
    }

    fn check_id(&self, id: PrimitiveId) -> Result<usize> {
        if id.fragment != self.key {
            return Err(RccError::Connection(
                "Primitive does not belong to this fragment".to_string(),
            ));
        }
        match self.slots.get(id.index) {
            Some(slot) if !slot.removed => Ok(id.index),
            Some(slot) => Err(RccError::Connection(format!(
                "Primitive '{}' was removed",
                slot.node.name
            ))),
            None => Err(RccError::Connection("Unknown primitive".to_string())),
        }
    }

    fn check_source(&self, source: OutPortRef) -> Result<()> {
        if source.fragment != self.key {
            return Err(RccError::Connection(
                "Source port is not owned by this fragment or its children".to_string(),
            ));
        }
        let exists = match source.owner {
            PortOwner::Boundary => source.port < self.inputs.len(),
            PortOwner::Child(index) => {
                let index = self.check_id(self.id(index))?;
                source.port < self.slots[index].node.out_port_count()
            }
        };
        if !exists {
            return Err(RccError::Connection("Unknown source port".to_string()));
        }
        Ok(())
    }

    /// Remove a child. Dependents are not disconnected.
    pub fn remove(&mut self, id: PrimitiveId) -> Result<Node> {
        let index = self.check_id(id)?;
        self.slots[index].removed = true;
        Ok(self.slots[index].node.clone())
    }

    pub fn get(&self, id: PrimitiveId) -> Result<&Node> {
        let index = self.check_id(id)?;
        Ok(&self.slots[index].node)
    }

    pub fn primitive_mut(&mut self, id: PrimitiveId) -> Result<&mut Primitive> {
        let index = self.check_id(id)?;
        let Node { name, body } = &mut self.slots[index].node;
        match body {
            NodeBody::Primitive(p) => Ok(p),
            NodeBody::Fragment(_) => Err(RccError::Connection(format!(
                "'{}' is a fragment, not a primitive",
                name
            ))),
        }
    }

    pub fn fragment_mut(&mut self, id: PrimitiveId) -> Result<&mut Fragment> {
        let index = self.check_id(id)?;
        let Node { name, body } = &mut self.slots[index].node;
        match body {
            NodeBody::Fragment(f) => Ok(f),
            NodeBody::Primitive(_) => Err(RccError::Connection(format!(
                "'{}' is a primitive, not a fragment",
                name
            ))),
        }
    }

    pub fn find(&self, name: &str) -> Option<PrimitiveId> {
        self.live_index(name).map(|index| self.id(index))
    }

    /// Live children in insertion order
    pub fn children(&self) -> impl Iterator<Item = (PrimitiveId, &Node)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.removed)
            .map(move |(index, s)| (self.id(index), &s.node))
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| !s.removed).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn inputs(&self) -> &[InPort] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[FragmentOutPort] {
        &self.outputs
    }

    pub fn input_names(&self) -> Vec<&str> {
        self.inputs.iter().map(|p| p.name.as_str()).collect()
    }

    pub fn output_names(&self) -> Vec<&str> {
        self.outputs.iter().map(|p| p.name.as_str()).collect()
    }

    /// Boundary input `name`, created on first use; returns its inner source
    pub fn add_input(&mut self, name: &str) -> Result<OutPortRef> {
        let index = match self.inputs.iter().position(|p| p.name == name) {
            Some(index) => index,
            None => {
                check_boundary_name(name, "in")?;
                self.inputs.push(InPort::new(name));
                self.inputs.len() - 1
            }
        };
        Ok(OutPortRef {
            fragment: self.key,
            owner: PortOwner::Boundary,
            port: index,
        })
    }

    pub fn input(&self, name: &str) -> Option<OutPortRef> {
        self.inputs
            .iter()
            .position(|p| p.name == name)
            .map(|port| OutPortRef {
                fragment: self.key,
                owner: PortOwner::Boundary,
                port,
            })
    }

    /// Re-export `source` as boundary output `name`
    pub fn add_output(&mut self, name: &str, source: OutPortRef) -> Result<()> {
        check_boundary_name(name, "out")?;
        self.check_source(source)?;
        if self.outputs.iter().any(|o| o.name == name) {
            return Err(RccError::Naming(format!("Duplicate fragment output '{}'", name)));
        }
        self.outputs.push(FragmentOutPort {
            name: name.to_string(),
            source,
        });
        Ok(())
    }

    /// Out-port `port` of a child; leaf primitives grow the port on first use
    pub fn out_port(&mut self, id: PrimitiveId, port: &str) -> Result<OutPortRef> {
        let index = self.check_id(id)?;
        let port_index = match &mut self.slots[index].node.body {
            NodeBody::Primitive(p) => p.declare_out_port(port)?,
            NodeBody::Fragment(f) => f
                .outputs
                .iter()
                .position(|o| o.name == port)
                .ok_or_else(|| {
                    RccError::Connection(format!("Fragment has no output '{}'", port))
                })?,
        };
        Ok(OutPortRef {
            fragment: self.key,
            owner: PortOwner::Child(index),
            port: port_index,
        })
    }

    fn target_in_port(&mut self, id: PrimitiveId, in_port: &str) -> Result<&mut InPort> {
        let index = self.check_id(id)?;
        match &mut self.slots[index].node.body {
            NodeBody::Primitive(p) => {
                let port = p.in_port_index_or_create(in_port)?;
                Ok(&mut p.in_ports[port])
            }
            NodeBody::Fragment(f) => {
                let port = f.add_input(in_port)?.port;
                Ok(&mut f.inputs[port])
            }
        }
    }

    /// Connect a child's in-port to a source of this fragment
    pub fn connect(&mut self, id: PrimitiveId, in_port: &str, source: OutPortRef) -> Result<()> {
        self.check_source(source)?;
        self.target_in_port(id, in_port)?.connect_to(source)
    }

    /// Retention is a property of a connection; the in-port must have a source
    pub fn set_debug_retention(
        &mut self,
        id: PrimitiveId,
        in_port: &str,
        seconds: Option<f64>,
    ) -> Result<()> {
        let port = self.target_in_port(id, in_port)?;
        if seconds.is_some() && port.source.is_none() {
            return Err(RccError::Connection(format!(
                "Cannot set debug retention on unconnected in-port '{}'",
                port.name
            )));
        }
        port.set_debug_retention(seconds)
    }

    /// `(owner name, port name)` of a source; the owner is `parent` for boundary inputs
    pub fn describe_source(&self, source: OutPortRef) -> Option<(&str, &str)> {
        match source.owner {
            PortOwner::Boundary => self
                .inputs
                .get(source.port)
                .map(|p| (PARENT, p.name.as_str())),
            PortOwner::Child(index) => {
                let node = &self.slots.get(index)?.node;
                Some((node.name.as_str(), node.out_port_name(source.port)?))
            }
        }
    }

    /// Children in-ports and boundary outputs fed by `id`
    pub fn dependents_of(&self, id: PrimitiveId) -> Vec<String> {
        let mut dependents = Vec::new();
        if id.fragment != self.key {
            return dependents;
        }
        let feeds = |source: Option<OutPortRef>| {
            matches!(source, Some(s) if s.owner == PortOwner::Child(id.index))
        };
        for (_, node) in self.children() {
            for port in node.in_ports() {
                if feeds(port.source) {
                    dependents.push(format!("{}.{}", node.name, port.name));
                }
            }
        }
        for output in &self.outputs {
            if feeds(Some(output.source)) {
                dependents.push(format!("{}.{}", PARENT, output.name));
            }
        }
        dependents
    }

    /// Drop every connection and boundary output fed by `id`
    pub fn disconnect_dependents(&mut self, id: PrimitiveId) -> usize {
        if id.fragment != self.key {
            return 0;
        }
        let owner = PortOwner::Child(id.index);
        let mut count = 0;
        for slot in self.slots.iter_mut().filter(|s| !s.removed) {
            let ports = match &mut slot.node.body {
                NodeBody::Primitive(p) => &mut p.in_ports,
                NodeBody::Fragment(f) => &mut f.inputs,
            };
            for port in ports.iter_mut() {
                if matches!(port.source, Some(s) if s.owner == owner) {
                    port.source = None;
                    count += 1;
                }
            }
        }
        let before = self.outputs.len();
        self.outputs.retain(|o| o.source.owner != owner);
        count + (before - self.outputs.len())
    }

    /// Problems that would make the control core reject this net
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        self.collect_problems("", &mut problems);
        problems
    }

    fn collect_problems(&self, path: &str, problems: &mut Vec<String>) {
        let dangling = |source: OutPortRef| match source.owner {
            PortOwner::Child(index) => self.slots.get(index).map_or(true, |s| s.removed),
            PortOwner::Boundary => source.port >= self.inputs.len(),
        };
        for (_, node) in self.children() {
            let node_path = format!("{}{}", path, node.name);
            for port in node.in_ports() {
                if let Some(source) = port.source {
                    if dangling(source) {
                        problems.push(format!(
                            "{}.{} is connected to a removed primitive",
                            node_path, port.name
                        ));
                    }
                }
            }
            if let NodeBody::Fragment(inner) = &node.body {
                inner.collect_problems(&format!("{}/", node_path), problems);
            }
        }
        for output in &self.outputs {
            if dangling(output.source) {
                problems.push(format!(
                    "{}{} re-exports a removed primitive",
                    path, output.name
                ));
            }
        }
        // an input nothing reads has no place in the wire text
        let consumed = |port: usize| {
            let reads = |source: Option<OutPortRef>| {
                matches!(source, Some(s) if s.owner == PortOwner::Boundary && s.port == port)
            };
            self.children()
                .any(|(_, node)| node.in_ports().iter().any(|p| reads(p.source)))
                || self.outputs.iter().any(|o| reads(Some(o.source)))
        };
        for (port, input) in self.inputs.iter().enumerate() {
            if !consumed(port) {
                problems.push(format!("{}{} is never consumed", path, input.name));
            }
        }
    }

    /// Netcomm keys of all netcomm primitives, nested fragments included
    pub fn netcomm_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        for (_, node) in self.children() {
            match &node.body {
                NodeBody::Primitive(p) => keys.extend(p.netcomm_key().map(str::to_string)),
                NodeBody::Fragment(f) => keys.extend(f.netcomm_keys()),
            }
        }
        keys
    }

    /// Distinct primitive type names used anywhere in the net
    pub fn type_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.collect_type_names(&mut names);
        names
    }

    fn collect_type_names(&self, names: &mut Vec<String>) {
        for (_, node) in self.children() {
            match &node.body {
                NodeBody::Primitive(p) => {
                    if !names.iter().any(|n| n == &p.type_name) {
                        names.push(p.type_name.clone());
                    }
                }
                NodeBody::Fragment(f) => f.collect_type_names(names),
            }
        }
    }
}

/// Registered primitive types of an engine catalogue
#[derive(Debug, Clone, Default)]
pub struct PrimitiveCatalog {
    entries: HashMap<String, PrimitiveKind>,
}

impl PrimitiveCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalogue with the core netcomm families registered
    pub fn with_defaults() -> Self {
        let mut catalog = Self::new();
        for scalar in ["Boolean", "Int", "Double"] {
            for direction in ["In", "Out"] {
                catalog.register(
                    &format!("Core::{}Netcomm{}", scalar, direction),
                    PrimitiveKind::Netcomm {
                        key_param: "Key".to_string(),
                    },
                );
            }
        }
        catalog
    }

    pub fn register(&mut self, type_name: &str, kind: PrimitiveKind) {
        self.entries.insert(type_name.to_string(), kind);
    }

    pub fn kind_of(&self, type_name: &str) -> PrimitiveKind {
        self.entries
            .get(type_name)
            .cloned()
            .unwrap_or(PrimitiveKind::Leaf)
    }

    pub fn instantiate(&self, type_name: &str) -> Result<Primitive> {
        Primitive::with_kind(type_name, self.kind_of(type_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_primitive(fragment: &mut Fragment, name: &str, type_name: &str) -> PrimitiveId {
        fragment
            .add_named(name, Primitive::new(type_name).unwrap())
            .unwrap()
    }

    #[test]
    fn test_reconnect_same_source_is_noop() {
        let mut fragment = Fragment::new();
        let a = add_primitive(&mut fragment, "a", "Core::DoubleValue");
        let b = add_primitive(&mut fragment, "b", "Core::DoubleValue");
        let sum = add_primitive(&mut fragment, "sum", "Core::DoubleAdd");

        let from_a = fragment.out_port(a, "outValue").unwrap();
        let from_b = fragment.out_port(b, "outValue").unwrap();

        fragment.connect(sum, "inFirst", from_a).unwrap();
        fragment.connect(sum, "inFirst", from_a).unwrap();
        let err = fragment.connect(sum, "inFirst", from_b).unwrap_err();
        assert!(matches!(err, RccError::Connection(_)));

        let port = fragment.get(sum).unwrap().in_ports()[0].clone();
        assert_eq!(port.source(), Some(from_a));
    }

    #[test]
    fn test_boundary_port_naming() {
        let mut fragment = Fragment::new();
        assert!(matches!(fragment.add_input("value"), Err(RccError::Naming(_))));
        assert!(matches!(fragment.add_input("in.value"), Err(RccError::Naming(_))));
        let inner = fragment.add_input("inValue").unwrap();

        assert!(matches!(fragment.add_output("result", inner), Err(RccError::Naming(_))));
        assert!(matches!(fragment.add_output("out.result", inner), Err(RccError::Naming(_))));
        // an input may be re-exported directly
        fragment.add_output("outValue", inner).unwrap();
        assert_eq!(fragment.input_names(), vec!["inValue"]);
        assert_eq!(fragment.output_names(), vec!["outValue"]);
    }

    #[test]
    fn test_foreign_port_rejected() {
        let mut first = Fragment::new();
        let mut second = Fragment::new();
        let a = add_primitive(&mut first, "a", "Core::DoubleValue");
        let b = add_primitive(&mut second, "b", "Core::DoubleNot");
        let foreign = first.out_port(a, "outValue").unwrap();

        assert!(matches!(second.connect(b, "inValue", foreign), Err(RccError::Connection(_))));
        assert!(matches!(second.add_output("outX", foreign), Err(RccError::Connection(_))));
        assert!(second.get(a).is_err());
    }

    #[test]
    fn test_anonymous_names_are_per_fragment() {
        let mut first = Fragment::new();
        let mut second = Fragment::new();
        let a = first.add(Primitive::new("Core::BooleanValue").unwrap());
        let b = first.add(Primitive::new("Core::BooleanValue").unwrap());
        let c = second.add(Primitive::new("Core::BooleanValue").unwrap());
        assert_eq!(first.get(a).unwrap().name(), "p0");
        assert_eq!(first.get(b).unwrap().name(), "p1");
        assert_eq!(second.get(c).unwrap().name(), "p0");

        first.add_named("p2", Primitive::new("Core::BooleanValue").unwrap()).unwrap();
        let d = first.add(Primitive::new("Core::BooleanValue").unwrap());
        assert_eq!(first.get(d).unwrap().name(), "p3");
        assert!(first.add_named("p3", Primitive::new("X").unwrap()).is_err());
        assert!(first.add_named("parent", Primitive::new("X").unwrap()).is_err());
    }

    #[test]
    fn test_remove_does_not_disconnect_dependents() {
        let mut fragment = Fragment::new();
        let a = add_primitive(&mut fragment, "a", "Core::DoubleValue");
        let sink = add_primitive(&mut fragment, "sink", "Core::DoubleNetcommOut");
        let source = fragment.out_port(a, "outValue").unwrap();
        fragment.connect(sink, "inValue", source).unwrap();
        fragment.add_output("outA", source).unwrap();

        fragment.remove(a).unwrap();
        assert!(fragment.get(a).is_err());
        assert_eq!(fragment.dependents_of(a), vec!["sink.inValue", "parent.outA"]);
        assert_eq!(fragment.validate().len(), 2);

        assert_eq!(fragment.disconnect_dependents(a), 2);
        assert!(fragment.validate().is_empty());
        assert!(fragment.outputs().is_empty());
    }

    #[test]
    fn test_nested_fragment_boundary() {
        let mut inner = Fragment::new();
        let flag = inner.add_input("inFlag").unwrap();
        let not = add_primitive(&mut inner, "not", "Core::BooleanNot");
        inner.connect(not, "inValue", flag).unwrap();
        let negated = inner.out_port(not, "outValue").unwrap();
        inner.add_output("outNegated", negated).unwrap();

        let mut outer = Fragment::new();
        let value = add_primitive(&mut outer, "value", "Core::BooleanValue");
        let sub = outer.add_named("sub", inner).unwrap();
        let src = outer.out_port(value, "outValue").unwrap();
        outer.connect(sub, "inFlag", src).unwrap();

        assert!(outer.out_port(sub, "outMissing").is_err());
        let result = outer.out_port(sub, "outNegated").unwrap();
        outer.add_output("outResult", result).unwrap();
        assert_eq!(outer.describe_source(result), Some(("sub", "outNegated")));
        assert_eq!(outer.get(sub).unwrap().kind(), NodeKind::Fragment);
        assert!(outer.get(sub).unwrap().kind().is_container());
    }

    #[test]
    fn test_debug_retention_must_be_non_negative() {
        let mut fragment = Fragment::new();
        let a = add_primitive(&mut fragment, "a", "Core::DoubleValue");
        let sink = add_primitive(&mut fragment, "sink", "Core::DoubleNetcommOut");
        let source = fragment.out_port(a, "outValue").unwrap();
        fragment.connect(sink, "inValue", source).unwrap();
        assert!(fragment.set_debug_retention(sink, "inValue", Some(-1.0)).is_err());
        assert!(fragment.set_debug_retention(sink, "inValue", Some(f64::NAN)).is_err());
        fragment.set_debug_retention(sink, "inValue", Some(2.5)).unwrap();
        let port = fragment.get(sink).unwrap().as_primitive().unwrap().in_port("inValue").unwrap();
        assert_eq!(port.debug_retention(), Some(2.5));
    }

    #[test]
    fn test_debug_retention_requires_connection() {
        let mut fragment = Fragment::new();
        let a = add_primitive(&mut fragment, "a", "Core::DoubleValue");
        let err = fragment.set_debug_retention(a, "inValue", Some(2.5)).unwrap_err();
        assert!(matches!(err, RccError::Connection(_)));
        // clearing is always allowed
        fragment.set_debug_retention(a, "inValue", None).unwrap();
        let port = fragment.get(a).unwrap().as_primitive().unwrap().in_port("inValue").unwrap();
        assert_eq!(port.debug_retention(), None);
    }

    #[test]
    fn test_typed_child_access() {
        let mut outer = Fragment::new();
        let value = add_primitive(&mut outer, "value", "Core::DoubleValue");
        let sub = outer.add_named("sub", Fragment::new()).unwrap();

        outer.primitive_mut(value).unwrap().set_param("Value", "1.5").unwrap();
        assert_eq!(outer.get(value).unwrap().as_primitive().unwrap().param("Value"), Some("1.5"));
        outer.fragment_mut(sub).unwrap().add_input("inFlag").unwrap();
        assert_eq!(outer.get(sub).unwrap().in_ports()[0].name(), "inFlag");

        let err = outer.primitive_mut(sub).unwrap_err();
        assert!(matches!(err, RccError::Connection(ref m) if m.contains("'sub' is a fragment")));
        let err = outer.fragment_mut(value).unwrap_err();
        assert!(matches!(err, RccError::Connection(ref m) if m.contains("'value' is a primitive")));
    }

    #[test]
    fn test_unconsumed_input_is_a_problem() {
        let mut fragment = Fragment::new();
        let used = fragment.add_input("inUsed").unwrap();
        fragment.add_input("inUnused").unwrap();
        let not = add_primitive(&mut fragment, "not", "Core::BooleanNot");
        fragment.connect(not, "inValue", used).unwrap();
        assert_eq!(fragment.validate(), vec!["inUnused is never consumed"]);

        let passthrough = fragment.input("inUnused").unwrap();
        fragment.add_output("outPassthrough", passthrough).unwrap();
        assert!(fragment.validate().is_empty());

        let mut outer = Fragment::new();
        let mut inner = Fragment::new();
        inner.add_input("inIdle").unwrap();
        outer.add_named("sub", inner).unwrap();
        assert_eq!(outer.validate(), vec!["sub/inIdle is never consumed"]);
    }

    #[test]
    fn test_clone_is_a_separate_arena() {
        let mut original = Fragment::new();
        let flag = original.add_input("inFlag").unwrap();
        let not = add_primitive(&mut original, "not", "Core::BooleanNot");
        original.connect(not, "inValue", flag).unwrap();
        let negated = original.out_port(not, "outValue").unwrap();
        original.add_output("outNegated", negated).unwrap();
        let mut outer = Fragment::new();
        let sub = outer.add_named("sub", original.clone()).unwrap();
        let src = outer.add_input("inSource").unwrap();
        outer.connect(sub, "inFlag", src).unwrap();

        let mut copy = outer.clone();
        let sink = add_primitive(&mut copy, "sink", "Core::BooleanNetcommOut");
        assert!(matches!(copy.connect(sink, "inValue", src), Err(RccError::Connection(_))));
        assert!(copy.get(sub).is_err());

        let copied_sub = copy.find("sub").unwrap();
        let copied_out = copy.out_port(copied_sub, "outNegated").unwrap();
        copy.connect(sink, "inValue", copied_out).unwrap();
        assert_eq!(copy.describe_source(copied_out), Some(("sub", "outNegated")));
        let copied_src = copy.input("inSource").unwrap();
        assert_eq!(copy.get(copied_sub).unwrap().in_ports()[0].source(), Some(copied_src));
        assert!(copy.validate().is_empty());

        let inner = copy.get(copied_sub).unwrap().as_fragment().unwrap();
        let inner_not = inner.get(inner.find("not").unwrap()).unwrap();
        assert_eq!(inner_not.in_ports()[0].source(), inner.input("inFlag"));
        assert_eq!(inner.outputs()[0].source().owner(), PortOwner::Child(0));
    }

    #[test]
    fn test_parameters_and_catalog() {
        let catalog = PrimitiveCatalog::with_defaults();
        let mut out = catalog.instantiate("Core::DoubleNetcommOut").unwrap();
        out.set_param("Key", "speed").unwrap();
        assert_eq!(out.netcomm_key(), Some("speed"));
        assert!(out.set_param("Key", "it's").is_err());

        let mut value = catalog.instantiate("Core::DoubleArrayValue").unwrap();
        assert_eq!(value.kind(), &PrimitiveKind::Leaf);
        let array = Value::array(ValueType::Double, vec![Value::Double(1.5), Value::Double(2.0)]).unwrap();
        value.set_value("Value", &array).unwrap();
        assert_eq!(value.param("Value"), Some("[1.5,2]"));
        let ty = ValueType::Array(Box::new(ValueType::Double), 2);
        assert_eq!(value.value_param("Value", &ty).unwrap(), Some(array));
        assert!(Primitive::new("Bad Type").is_err());
    }
}
