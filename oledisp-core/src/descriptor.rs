//! Statically known bindings for one identifier class.
//!
//! A [`ClassDescriptor`] is what the code generator produces for a coclass or
//! dispinterface: a case-insensitive name→[`DispId`] table plus three
//! dispatch tables (methods, property getters, property putters) carrying the
//! parameter and result types used for coercion.
//!
//! Descriptors are immutable once built.  The name table is injective: one
//! case-folded name maps to exactly one ID and no ID is shared by two names.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::errors::DispatchError;
use crate::identifier::{
    DispId, Identifier, DISPID_EVALUATE, DISPID_NEWENUM, DISPID_PROPERTYPUT, DISPID_VALUE,
};
use crate::value::{Value, VarType};

/// Name under which the new-enumerator member is always reachable.
pub const NEWENUM_NAME: &str = "_NewEnum";
/// Name under which the evaluate member is always reachable.
pub const EVALUATE_NAME: &str = "_Evaluate";
/// Name of a designated object's default member.
pub const VALUE_MEMBER: &str = "_value_";

// ---------------------------------------------------------------------------
// Member metadata
// ---------------------------------------------------------------------------

/// One declared parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamDesc {
    pub name: String,
    #[serde(default, rename = "type")]
    pub ty: VarType,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
}

impl ParamDesc {
    pub fn new(name: impl Into<String>, ty: VarType) -> Self {
        Self {
            name: name.into(),
            ty,
            optional: false,
        }
    }

    pub fn optional(name: impl Into<String>, ty: VarType) -> Self {
        Self {
            optional: true,
            ..Self::new(name, ty)
        }
    }
}

/// Which dispatch table an entry lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberKind {
    Method,
    PropertyGet,
    PropertyPut,
}

/// Invocation metadata for one table entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberInfo {
    pub name: String,
    pub params: Vec<ParamDesc>,
    pub result: VarType,
    /// Accepts any number of extra arguments after `params`, uncoerced.
    pub variadic: bool,
}

impl MemberInfo {
    /// Check the argument count and coerce each argument to its declared type.
    pub fn coerce_args(&self, args: Vec<Value>) -> Result<Vec<Value>, DispatchError> {
        let required = self.params.iter().filter(|p| !p.optional).count();
        if args.len() < required || (!self.variadic && args.len() > self.params.len()) {
            return Err(DispatchError::InvalidRequestShape(format!(
                "{} expects {}..={} arguments, got {}",
                self.name,
                required,
                self.params.len(),
                args.len()
            )));
        }

        args.into_iter()
            .enumerate()
            .map(|(i, arg)| match self.params.get(i) {
                Some(param) => param
                    .ty
                    .coerce(arg, &format!("{} argument {i} ({})", self.name, param.name)),
                None => Ok(arg),
            })
            .collect()
    }

    pub fn coerce_result(&self, result: Value) -> Result<Value, DispatchError> {
        self.result
            .coerce(result, &format!("{} result", self.name))
    }
}

// ---------------------------------------------------------------------------
// ClassDescriptor
// ---------------------------------------------------------------------------

/// Static metadata mapping names/IDs to invocable members for one class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DescriptorDef", into = "DescriptorDef")]
pub struct ClassDescriptor {
    identifier: Identifier,
    name: String,
    default_source: Option<Identifier>,
    interfaces: Vec<Identifier>,
    name_to_id: HashMap<String, DispId>,
    methods: BTreeMap<DispId, MemberInfo>,
    getters: BTreeMap<DispId, MemberInfo>,
    putters: BTreeMap<DispId, MemberInfo>,
}

impl ClassDescriptor {
    pub fn builder(identifier: Identifier, name: impl Into<String>) -> DescriptorBuilder {
        DescriptorBuilder {
            identifier,
            name: name.into(),
            default_source: None,
            interfaces: Vec::new(),
            members: Vec::new(),
            id_only: Vec::new(),
        }
    }

    pub fn identifier(&self) -> Identifier {
        self.identifier
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identifier of the class's default outgoing (event) interface.
    pub fn default_source(&self) -> Option<Identifier> {
        self.default_source
    }

    /// Interfaces the class answers `QueryInterface` for, besides its own.
    pub fn interfaces(&self) -> &[Identifier] {
        &self.interfaces
    }

    /// Case-insensitive lookup in the static name table.
    pub fn id_of(&self, name: &str) -> Option<DispId> {
        self.name_to_id.get(&name.to_lowercase()).copied()
    }

    /// `true` when the entry at `id` named `name` can only be reached by ID.
    pub fn is_id_only(&self, name: &str, id: DispId) -> bool {
        self.id_of(name) != Some(id)
    }

    pub fn method(&self, id: DispId) -> Option<&MemberInfo> {
        self.methods.get(&id)
    }

    pub fn getter(&self, id: DispId) -> Option<&MemberInfo> {
        self.getters.get(&id)
    }

    pub fn putter(&self, id: DispId) -> Option<&MemberInfo> {
        self.putters.get(&id)
    }

    /// Declared name of a member, searching methods, getters, then putters.
    pub fn member_name(&self, id: DispId) -> Option<&str> {
        self.methods
            .get(&id)
            .or_else(|| self.getters.get(&id))
            .or_else(|| self.putters.get(&id))
            .map(|m| m.name.as_str())
    }

    /// All dispatch IDs in ascending order.
    pub fn dispids(&self) -> Vec<DispId> {
        let ids: BTreeSet<DispId> = self
            .methods
            .keys()
            .chain(self.getters.keys())
            .chain(self.putters.keys())
            .copied()
            .collect();
        ids.into_iter().collect()
    }

    /// Iterate `(kind, dispid, info)` over every table entry.
    pub fn entries(&self) -> impl Iterator<Item = (MemberKind, DispId, &MemberInfo)> {
        self.methods
            .iter()
            .map(|(id, m)| (MemberKind::Method, *id, m))
            .chain(self.getters.iter().map(|(id, m)| (MemberKind::PropertyGet, *id, m)))
            .chain(self.putters.iter().map(|(id, m)| (MemberKind::PropertyPut, *id, m)))
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Collects member declarations and validates them into a [`ClassDescriptor`].
#[derive(Debug, Clone)]
pub struct DescriptorBuilder {
    identifier: Identifier,
    name: String,
    default_source: Option<Identifier>,
    interfaces: Vec<Identifier>,
    members: Vec<(MemberKind, DispId, MemberInfo)>,
    id_only: Vec<(MemberKind, DispId, MemberInfo)>,
}

impl DescriptorBuilder {
    pub fn member(
        mut self,
        kind: MemberKind,
        name: impl Into<String>,
        id: DispId,
        params: Vec<ParamDesc>,
        result: VarType,
    ) -> Self {
        self.members.push((
            kind,
            id,
            MemberInfo {
                name: name.into(),
                params,
                result,
                variadic: false,
            },
        ));
        self
    }

    /// A table entry that is reachable by ID but not by name, such as an
    /// attribute whose name is taken by a method.
    pub fn id_only_member(
        mut self,
        kind: MemberKind,
        name: impl Into<String>,
        id: DispId,
        params: Vec<ParamDesc>,
        result: VarType,
    ) -> Self {
        self.id_only.push((
            kind,
            id,
            MemberInfo {
                name: name.into(),
                params,
                result,
                variadic: false,
            },
        ));
        self
    }

    /// A method taking any number of untyped arguments.
    pub fn variadic_method(mut self, name: impl Into<String>, id: DispId, result: VarType) -> Self {
        self.members.push((
            MemberKind::Method,
            id,
            MemberInfo {
                name: name.into(),
                params: Vec::new(),
                result,
                variadic: true,
            },
        ));
        self
    }

    pub fn method(
        self,
        name: impl Into<String>,
        id: DispId,
        params: Vec<ParamDesc>,
        result: VarType,
    ) -> Self {
        self.member(MemberKind::Method, name, id, params, result)
    }

    /// A read/write property: getter plus single-argument putter.
    pub fn property(self, name: impl Into<String>, id: DispId, ty: VarType) -> Self {
        let name = name.into();
        self.member(MemberKind::PropertyGet, name.clone(), id, Vec::new(), ty)
            .member(
                MemberKind::PropertyPut,
                name,
                id,
                vec![ParamDesc::new("value", ty)],
                VarType::Void,
            )
    }

    pub fn readonly_property(self, name: impl Into<String>, id: DispId, ty: VarType) -> Self {
        self.member(MemberKind::PropertyGet, name, id, Vec::new(), ty)
    }

    /// The default member invoked as a method (`DISPID_VALUE`).
    pub fn default_method(
        self,
        name: impl Into<String>,
        params: Vec<ParamDesc>,
        result: VarType,
    ) -> Self {
        self.method(name, DISPID_VALUE, params, result)
    }

    /// The default member fetched as a property (`DISPID_VALUE`).
    pub fn default_property(self, name: impl Into<String>, ty: VarType) -> Self {
        self.readonly_property(name, DISPID_VALUE, ty)
    }

    /// Declare the new-enumerator member (`DISPID_NEWENUM`).
    pub fn new_enum(self) -> Self {
        self.method(NEWENUM_NAME, DISPID_NEWENUM, Vec::new(), VarType::Object)
    }

    pub fn evaluate(self, params: Vec<ParamDesc>, result: VarType) -> Self {
        self.method(EVALUATE_NAME, DISPID_EVALUATE, params, result)
    }

    pub fn default_source(mut self, source: Identifier) -> Self {
        self.default_source = Some(source);
        self
    }

    pub fn interface(mut self, iid: Identifier) -> Self {
        self.interfaces.push(iid);
        self
    }

    pub fn build(self) -> Result<ClassDescriptor, DispatchError> {
        let mut name_to_id: HashMap<String, DispId> = HashMap::new();
        let mut id_to_name: HashMap<DispId, String> = HashMap::new();
        let mut methods = BTreeMap::new();
        let mut getters = BTreeMap::new();
        let mut putters = BTreeMap::new();

        let tables = self
            .members
            .into_iter()
            .map(|m| (true, m))
            .chain(self.id_only.into_iter().map(|m| (false, m)));
        for (named, (kind, id, info)) in tables {
            let folded = info.name.to_lowercase();
            if folded.is_empty() {
                return Err(DispatchError::InvalidDescriptor(format!(
                    "{}: member with dispid {id} has an empty name",
                    self.name
                )));
            }

            match name_to_id.get(&folded) {
                Some(&existing) if named && existing != id => {
                    return Err(DispatchError::InvalidDescriptor(format!(
                        "{}: '{}' declared with dispids {existing} and {id}",
                        self.name, info.name
                    )));
                }
                _ => {}
            }
            match id_to_name.get(&id) {
                Some(existing) if *existing != folded => {
                    return Err(DispatchError::InvalidDescriptor(format!(
                        "{}: dispid {id} shared by '{existing}' and '{}'",
                        self.name, info.name
                    )));
                }
                _ => {}
            }
            if named {
                name_to_id.insert(folded.clone(), id);
            }
            id_to_name.insert(id, folded);

            let table = match kind {
                MemberKind::Method => &mut methods,
                MemberKind::PropertyGet => &mut getters,
                MemberKind::PropertyPut => &mut putters,
            };
            if table.insert(id, info).is_some() {
                return Err(DispatchError::InvalidDescriptor(format!(
                    "{}: duplicate {kind:?} entry for dispid {id}",
                    self.name
                )));
            }
        }

        Ok(ClassDescriptor {
            identifier: self.identifier,
            name: self.name,
            default_source: self.default_source,
            interfaces: self.interfaces,
            name_to_id,
            methods,
            getters,
            putters,
        })
    }
}

// ---------------------------------------------------------------------------
// Designated members
// ---------------------------------------------------------------------------

/// First ID handed out to a designated member.
pub const DESIGNATED_DISPID_BASE: DispId = 1000;

/// A server object's public surface declared as member-name lists.
///
/// Attributes are numbered first, from [`DESIGNATED_DISPID_BASE`], then
/// methods.  A name listed as both a method and an attribute resolves to the
/// method; the attribute keeps its ID and stays reachable through it.
/// `readonly` entries match attribute names exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublicMembers {
    pub methods: Vec<String>,
    pub attrs: Vec<String>,
    pub readonly: Vec<String>,
    /// Extra interfaces answered by `QueryInterface`.
    pub interfaces: Vec<Identifier>,
    /// The object has a `_value_` default member.
    pub value: bool,
    /// The object has a `_NewEnum` enumerator.
    pub new_enum: bool,
    /// The object has an `_Evaluate` member.
    pub evaluate: bool,
}

impl PublicMembers {
    pub fn into_descriptor(
        self,
        identifier: Identifier,
        name: impl Into<String>,
    ) -> Result<ClassDescriptor, DispatchError> {
        let methods: HashSet<String> = self.methods.iter().map(|m| m.to_lowercase()).collect();
        let mut builder = ClassDescriptor::builder(identifier, name);
        for iid in &self.interfaces {
            builder = builder.interface(*iid);
        }

        // The default member is reached by ID only; puts go to DISPID_PROPERTYPUT.
        if self.value {
            builder = builder
                .id_only_member(MemberKind::PropertyGet, VALUE_MEMBER, DISPID_VALUE, Vec::new(), VarType::Any)
                .id_only_member(
                    MemberKind::PropertyPut,
                    VALUE_MEMBER,
                    DISPID_PROPERTYPUT,
                    vec![ParamDesc::new("value", VarType::Any)],
                    VarType::Void,
                );
        }
        if self.new_enum {
            builder = builder.method(NEWENUM_NAME, DISPID_NEWENUM, Vec::new(), VarType::Any);
        }
        if self.evaluate {
            builder = builder.evaluate(Vec::new(), VarType::Any);
        }

        let mut next = DESIGNATED_DISPID_BASE;
        for attr in &self.attrs {
            let readonly = self.readonly.contains(attr);
            builder = if methods.contains(&attr.to_lowercase()) {
                let getter = builder.id_only_member(
                    MemberKind::PropertyGet,
                    attr.as_str(),
                    next,
                    Vec::new(),
                    VarType::Any,
                );
                if readonly {
                    getter
                } else {
                    getter.id_only_member(
                        MemberKind::PropertyPut,
                        attr.as_str(),
                        next,
                        vec![ParamDesc::new("value", VarType::Any)],
                        VarType::Void,
                    )
                }
            } else if readonly {
                builder.readonly_property(attr.as_str(), next, VarType::Any)
            } else {
                builder.property(attr.as_str(), next, VarType::Any)
            };
            next += 1;
        }
        for method in &self.methods {
            builder = builder.variadic_method(method.as_str(), next, VarType::Any);
            next += 1;
        }
        builder.build()
    }
}

// ---------------------------------------------------------------------------
// Serialized form
// ---------------------------------------------------------------------------

/// On-disk member kind; `property` expands to a getter plus a putter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum MemberDefKind {
    Method,
    Get,
    Put,
    Property,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MemberDef {
    name: String,
    dispid: DispId,
    kind: MemberDefKind,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    readonly: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    params: Vec<ParamDesc>,
    #[serde(default, rename = "type")]
    result: VarType,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    variadic: bool,
    /// Reachable by dispatch ID only; the name resolves elsewhere.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    by_id: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DescriptorDef {
    identifier: Identifier,
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    default_source: Option<Identifier>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    interfaces: Vec<Identifier>,
    #[serde(default)]
    members: Vec<MemberDef>,
}

impl TryFrom<DescriptorDef> for ClassDescriptor {
    type Error = DispatchError;

    fn try_from(def: DescriptorDef) -> Result<Self, Self::Error> {
        let mut builder = ClassDescriptor::builder(def.identifier, def.name);
        builder.default_source = def.default_source;
        builder.interfaces = def.interfaces;

        for m in def.members {
            if m.by_id {
                let kind = match m.kind {
                    MemberDefKind::Method => MemberKind::Method,
                    MemberDefKind::Get | MemberDefKind::Property => MemberKind::PropertyGet,
                    MemberDefKind::Put => MemberKind::PropertyPut,
                };
                builder = builder.id_only_member(kind, m.name, m.dispid, m.params, m.result);
                continue;
            }
            builder = match m.kind {
                MemberDefKind::Method if m.variadic => {
                    builder.variadic_method(m.name, m.dispid, m.result)
                }
                MemberDefKind::Method => builder.method(m.name, m.dispid, m.params, m.result),
                MemberDefKind::Get => {
                    builder.member(MemberKind::PropertyGet, m.name, m.dispid, m.params, m.result)
                }
                MemberDefKind::Put => {
                    builder.member(MemberKind::PropertyPut, m.name, m.dispid, m.params, m.result)
                }
                MemberDefKind::Property if m.readonly => {
                    builder.readonly_property(m.name, m.dispid, m.result)
                }
                MemberDefKind::Property => builder.property(m.name, m.dispid, m.result),
            };
        }
        builder.build()
    }
}

impl From<ClassDescriptor> for DescriptorDef {
    fn from(desc: ClassDescriptor) -> Self {
        let members = desc
            .entries()
            .map(|(kind, dispid, info)| MemberDef {
                name: info.name.clone(),
                dispid,
                kind: match kind {
                    MemberKind::Method => MemberDefKind::Method,
                    MemberKind::PropertyGet => MemberDefKind::Get,
                    MemberKind::PropertyPut => MemberDefKind::Put,
                },
                readonly: false,
                params: info.params.clone(),
                result: info.result,
                variadic: info.variadic,
                by_id: desc.is_id_only(&info.name, dispid),
            })
            .collect();

        DescriptorDef {
            identifier: desc.identifier,
            name: desc.name,
            default_source: desc.default_source,
            interfaces: desc.interfaces,
            members,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
