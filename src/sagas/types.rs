//! Type descriptors used to analyse saga declarations.
//!
//! Sagas, saga data and messages are described in a [`TypeCatalog`]: an
//! arena of [`TypeDescriptor`]s linked through base types and implemented
//! interfaces. Generic types reference their parameters by position, and
//! [`TypeCatalog::closing_type_arguments`] walks a base chain substituting
//! arguments until it reaches the requested open generic.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::domain::SAGA_ID_PROPERTY;

use super::mapping::{MessageMapping, SagaMapper};

/// Handle of a type inside its catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TypeKey(usize);

/// Reference to a type, possibly generic
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeExpr {
    /// A concrete or generic type with its arguments
    Named { key: TypeKey, args: Vec<TypeExpr> },

    /// The n-th generic parameter of the enclosing type
    Param(usize),
}

impl TypeExpr {
    pub fn generic(key: TypeKey, args: impl IntoIterator<Item = TypeExpr>) -> Self {
        Self::Named {
            key,
            args: args.into_iter().collect(),
        }
    }

    /// Key of a named type
    pub fn key(&self) -> Option<TypeKey> {
        match self {
            Self::Named { key, .. } => Some(*key),
            Self::Param(_) => None,
        }
    }

    fn substitute(&self, args: &[TypeExpr]) -> TypeExpr {
        match self {
            Self::Param(index) => args.get(*index).cloned().unwrap_or(Self::Param(*index)),
            Self::Named { key, args: inner } => Self::Named {
                key: *key,
                args: inner.iter().map(|a| a.substitute(args)).collect(),
            },
        }
    }
}

impl From<TypeKey> for TypeExpr {
    fn from(key: TypeKey) -> Self {
        Self::Named { key, args: Vec::new() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeKind {
    Primitive,
    Class,
    Interface,
}

/// A property of a type
#[derive(Debug, Clone, PartialEq)]
pub struct MemberDescriptor {
    pub name: String,
    pub ty: TypeExpr,

    /// Marked as a unique correlation property
    pub unique: bool,
}

#[derive(Debug, Clone)]
pub struct TypeDescriptor {
    pub name: String,
    pub kind: TypeKind,
    pub generic_params: usize,
    pub base: Option<TypeExpr>,
    pub interfaces: Vec<TypeExpr>,
    pub members: Vec<MemberDescriptor>,

    /// Mappings declared by a saga; `None` when the type declares none and
    /// inherits those of its base
    pub mappings: Option<Vec<MessageMapping>>,
}

impl TypeDescriptor {
    fn new(name: String, kind: TypeKind) -> Self {
        Self {
            name,
            kind,
            generic_params: 0,
            base: None,
            interfaces: Vec::new(),
            members: Vec::new(),
            mappings: None,
        }
    }
}

/// Keys of the types every catalog starts with
#[derive(Debug, Clone, Copy)]
pub struct WellKnownTypes {
    pub guid: TypeKey,
    pub string: TypeKey,
    pub int32: TypeKey,
    pub int64: TypeKey,
    pub boolean: TypeKey,
    pub message: TypeKey,
    pub command: TypeKey,
    pub event: TypeKey,
    /// `Saga<TSagaData>`
    pub saga: TypeKey,
    /// `ContainSagaData`, base class exposing `Id`, `Originator`, `OriginalMessageId`
    pub contain_saga_data: TypeKey,
    /// `IAmStartedByMessages<TMessage>`
    pub started_by: TypeKey,
    /// `IHandleMessages<TMessage>`
    pub handles: TypeKey,
    /// `IHandleTimeouts<TTimeout>`
    pub handles_timeouts: TypeKey,
    /// `IFindSagas<TSagaData, TMessage>`
    pub find_sagas: TypeKey,
}

/// Arena of type descriptors
#[derive(Debug, Clone)]
pub struct TypeCatalog {
    types: Vec<TypeDescriptor>,
    well_known: WellKnownTypes,
}

impl Default for TypeCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeCatalog {
    pub fn new() -> Self {
        let mut types = Vec::new();
        let mut push = |name: &str, kind: TypeKind, generic_params: usize| {
            let mut descriptor = TypeDescriptor::new(name.to_string(), kind);
            descriptor.generic_params = generic_params;
            types.push(descriptor);
            TypeKey(types.len() - 1)
        };

        let guid = push("Guid", TypeKind::Primitive, 0);
        let string = push("String", TypeKind::Primitive, 0);
        let int32 = push("Int32", TypeKind::Primitive, 0);
        let int64 = push("Int64", TypeKind::Primitive, 0);
        let boolean = push("Boolean", TypeKind::Primitive, 0);
        let message = push("IMessage", TypeKind::Interface, 0);
        let command = push("ICommand", TypeKind::Interface, 0);
        let event = push("IEvent", TypeKind::Interface, 0);
        let saga = push("Saga", TypeKind::Class, 1);
        let contain_saga_data = push("ContainSagaData", TypeKind::Class, 0);
        let handles = push("IHandleMessages", TypeKind::Interface, 1);
        let started_by = push("IAmStartedByMessages", TypeKind::Interface, 1);
        let handles_timeouts = push("IHandleTimeouts", TypeKind::Interface, 1);
        let find_sagas = push("IFindSagas", TypeKind::Interface, 2);

        types[command.0].interfaces.push(message.into());
        types[event.0].interfaces.push(message.into());
        types[started_by.0]
            .interfaces
            .push(TypeExpr::generic(handles, [TypeExpr::Param(0)]));
        types[contain_saga_data.0].members = vec![
            member(SAGA_ID_PROPERTY, guid.into()),
            member("Originator", string.into()),
            member("OriginalMessageId", string.into()),
        ];

        Self {
            types,
            well_known: WellKnownTypes {
                guid,
                string,
                int32,
                int64,
                boolean,
                message,
                command,
                event,
                saga,
                contain_saga_data,
                started_by,
                handles,
                handles_timeouts,
                find_sagas,
            },
        }
    }

    pub fn well_known(&self) -> WellKnownTypes {
        self.well_known
    }

    /// Start describing a new class
    pub fn define(&mut self, name: impl Into<String>) -> TypeBuilder<'_> {
        self.push(name.into(), TypeKind::Class)
    }

    /// Start describing a new interface
    pub fn define_interface(&mut self, name: impl Into<String>) -> TypeBuilder<'_> {
        self.push(name.into(), TypeKind::Interface)
    }

    fn push(&mut self, name: String, kind: TypeKind) -> TypeBuilder<'_> {
        self.types.push(TypeDescriptor::new(name, kind));
        let key = TypeKey(self.types.len() - 1);
        TypeBuilder { catalog: self, key }
    }

    pub fn get(&self, key: TypeKey) -> Option<&TypeDescriptor> {
        self.types.get(key.0)
    }

    pub fn get_mut(&mut self, key: TypeKey) -> Option<&mut TypeDescriptor> {
        self.types.get_mut(key.0)
    }

    /// First type registered under `name`
    pub fn lookup(&self, name: &str) -> Option<TypeKey> {
        self.types.iter().position(|t| t.name == name).map(TypeKey)
    }

    pub fn name(&self, key: TypeKey) -> &str {
        self.get(key).map(|t| t.name.as_str()).unwrap_or("<unknown>")
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn types(&self) -> impl Iterator<Item = (TypeKey, &TypeDescriptor)> {
        self.types.iter().enumerate().map(|(i, t)| (TypeKey(i), t))
    }

    /// Render a type reference, e.g. `Saga<OrderData>`
    pub fn display(&self, expr: &TypeExpr) -> String {
        match expr {
            TypeExpr::Param(index) => format!("T{}", index),
            TypeExpr::Named { key, args } if args.is_empty() => self.name(*key).to_string(),
            TypeExpr::Named { key, args } => {
                let args: Vec<String> = args.iter().map(|a| self.display(a)).collect();
                format!("{}<{}>", self.name(*key), args.join(", "))
            }
        }
    }

    /// Walk the base-class chain of `ty` until `open` is reached and return
    /// the arguments it is closed with
    pub fn closing_type_arguments(&self, ty: TypeKey, open: TypeKey) -> Option<Vec<TypeExpr>> {
        let mut current = TypeExpr::from(ty);

        // Bounded so a malformed catalog with a base cycle cannot loop forever.
        for _ in 0..=self.types.len() {
            let TypeExpr::Named { key, args } = &current else {
                return None;
            };
            if *key == open {
                return Some(args.clone());
            }

            let base = self.get(*key)?.base.as_ref()?;
            current = base.substitute(args);
        }

        None
    }

    /// The base chain of `ty`, starting with `ty` itself, with generic
    /// arguments substituted at each level
    fn lineage(&self, ty: TypeKey) -> Vec<TypeExpr> {
        let mut chain = vec![TypeExpr::from(ty)];
        let mut seen = HashSet::from([ty]);

        while let Some(TypeExpr::Named { key, args }) = chain.last().cloned() {
            let Some(base) = self.get(key).and_then(|t| t.base.as_ref()) else {
                break;
            };
            let base = base.substitute(&args);
            match base.key() {
                Some(base_key) if seen.insert(base_key) => chain.push(base),
                _ => break,
            }
        }

        chain
    }

    /// Every interface implemented by `ty`, directly, through a base class
    /// or through another interface
    pub fn implemented_interfaces(&self, ty: TypeKey) -> Vec<TypeExpr> {
        let mut found: Vec<TypeExpr> = Vec::new();
        let mut pending: VecDeque<TypeExpr> = VecDeque::new();

        for level in self.lineage(ty) {
            if let TypeExpr::Named { key, args } = &level {
                if let Some(descriptor) = self.get(*key) {
                    pending.extend(descriptor.interfaces.iter().map(|i| i.substitute(args)));
                }
            }
        }

        while let Some(interface) = pending.pop_front() {
            if found.contains(&interface) {
                continue;
            }
            if let TypeExpr::Named { key, args } = &interface {
                if let Some(descriptor) = self.get(*key) {
                    pending.extend(descriptor.interfaces.iter().map(|i| i.substitute(args)));
                }
            }
            found.push(interface);
        }

        found
    }

    /// Argument lists of every closed form of the open interface `open`
    /// implemented by `ty`, in declaration order
    pub fn interface_arguments(&self, ty: TypeKey, open: TypeKey) -> Vec<Vec<TypeExpr>> {
        self.implemented_interfaces(ty)
            .into_iter()
            .filter_map(|i| match i {
                TypeExpr::Named { key, args } if key == open => Some(args),
                _ => None,
            })
            .collect()
    }

    /// True when `ty` is `interface` or implements it
    pub fn implements(&self, ty: TypeKey, interface: TypeKey) -> bool {
        ty == interface
            || self
                .implemented_interfaces(ty)
                .iter()
                .any(|i| i.key() == Some(interface))
    }

    /// Find a member by name on `ty` or any of its bases
    pub fn find_member(&self, ty: TypeKey, name: &str) -> Option<MemberDescriptor> {
        self.members(ty).into_iter().find(|m| m.name == name)
    }

    /// All members of `ty` and its bases; a derived member hides a base
    /// member of the same name
    pub fn members(&self, ty: TypeKey) -> Vec<MemberDescriptor> {
        let mut members: Vec<MemberDescriptor> = Vec::new();

        for level in self.lineage(ty) {
            let TypeExpr::Named { key, args } = &level else {
                continue;
            };
            let Some(descriptor) = self.get(*key) else {
                continue;
            };
            for m in &descriptor.members {
                if !members.iter().any(|existing| existing.name == m.name) {
                    members.push(MemberDescriptor {
                        name: m.name.clone(),
                        ty: m.ty.substitute(args),
                        unique: m.unique,
                    });
                }
            }
        }

        members
    }

    /// Mappings of a saga: those of the most derived type declaring any
    pub fn saga_mappings(&self, saga: TypeKey) -> Vec<MessageMapping> {
        self.lineage(saga)
            .iter()
            .filter_map(|level| level.key())
            .filter_map(|key| self.get(key))
            .find_map(|t| t.mappings.clone())
            .unwrap_or_default()
    }
}

fn member(name: &str, ty: TypeExpr) -> MemberDescriptor {
    MemberDescriptor {
        name: name.to_string(),
        ty,
        unique: false,
    }
}

/// Fluent builder returned by [`TypeCatalog::define`]
pub struct TypeBuilder<'c> {
    catalog: &'c mut TypeCatalog,
    key: TypeKey,
}

impl<'c> TypeBuilder<'c> {
    fn descriptor(&mut self) -> &mut TypeDescriptor {
        &mut self.catalog.types[self.key.0]
    }

    pub fn generic_params(mut self, count: usize) -> Self {
        self.descriptor().generic_params = count;
        self
    }

    pub fn extends(mut self, base: impl Into<TypeExpr>) -> Self {
        self.descriptor().base = Some(base.into());
        self
    }

    pub fn implements(mut self, interface: impl Into<TypeExpr>) -> Self {
        self.descriptor().interfaces.push(interface.into());
        self
    }

    pub fn member(mut self, name: impl Into<String>, ty: impl Into<TypeExpr>) -> Self {
        self.descriptor().members.push(MemberDescriptor {
            name: name.into(),
            ty: ty.into(),
            unique: false,
        });
        self
    }

    /// A member marked as a unique correlation property
    pub fn unique_member(mut self, name: impl Into<String>, ty: impl Into<TypeExpr>) -> Self {
        self.descriptor().members.push(MemberDescriptor {
            name: name.into(),
            ty: ty.into(),
            unique: true,
        });
        self
    }

    /// Declare how messages correlate to instances of this saga
    pub fn configure_how_to_find_saga(mut self, configure: impl FnOnce(&mut SagaMapper)) -> Self {
        let mut mapper = SagaMapper::default();
        configure(&mut mapper);
        self.descriptor().mappings = Some(mapper.into_mappings());
        self
    }

    pub fn key(self) -> TypeKey {
        self.key
    }
}

/// Decides which types are messages
#[derive(Clone)]
pub struct Conventions {
    markers: Vec<TypeKey>,
    custom: Option<Arc<dyn Fn(&TypeDescriptor) -> bool + Send + Sync>>,
}

impl Conventions {
    /// Messages are types implementing `IMessage`, `ICommand` or `IEvent`
    pub fn new(well_known: WellKnownTypes) -> Self {
        Self {
            markers: vec![well_known.message, well_known.command, well_known.event],
            custom: None,
        }
    }

    /// Additionally treat types matching `predicate` as messages
    pub fn with_message_convention<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&TypeDescriptor) -> bool + Send + Sync + 'static,
    {
        self.custom = Some(Arc::new(predicate));
        self
    }

    pub fn is_message_type(&self, catalog: &TypeCatalog, ty: TypeKey) -> bool {
        let Some(descriptor) = catalog.get(ty) else {
            return false;
        };
        if descriptor.kind == TypeKind::Primitive {
            return false;
        }
        if let Some(custom) = &self.custom {
            if custom(descriptor) {
                return true;
            }
        }
        // The marker interfaces themselves are not messages.
        !self.markers.contains(&ty) && self.markers.iter().any(|m| catalog.implements(ty, *m))
    }
}

impl fmt::Debug for Conventions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conventions")
            .field("markers", &self.markers)
            .field("custom", &self.custom.is_some())
            .finish()
    }
}
