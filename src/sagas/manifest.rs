//! Declarative type manifests.
//!
//! A manifest describes saga data, messages, sagas and finders in YAML so
//! saga metadata can be inspected without writing code:
//!
//! ```yaml
//! types:
//!   - name: OrderData
//!     base: ContainSagaData
//!     members:
//!       - { name: OrderId, type: String, unique: true }
//!   - name: StartOrder
//!     implements: [ICommand]
//!     members:
//!       - { name: OrderId, type: String }
//!   - name: OrderSaga
//!     base: Saga<OrderData>
//!     implements: [IAmStartedByMessages<StartOrder>]
//!     mappings:
//!       - { message: StartOrder, property: OrderId, to_saga: OrderId }
//! ```
//!
//! Generic types list their parameter names in `generic_params`; those names
//! can then be used inside the type's own base, interfaces and members.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

use super::mapping::MessageMapping;
use super::metadata::SagaMetadataCollection;
use super::types::{Conventions, MemberDescriptor, TypeCatalog, TypeExpr, TypeKey};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    #[serde(default)]
    pub types: Vec<TypeDefinition>,

    /// Saga types to analyse; every non-generic type closing `Saga<T>` when
    /// omitted
    #[serde(default)]
    pub sagas: Option<Vec<String>>,

    /// Custom finder types
    #[serde(default)]
    pub finders: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeDefinition {
    pub name: String,

    #[serde(default)]
    pub kind: DefinitionKind,

    #[serde(default)]
    pub generic_params: Vec<String>,

    pub base: Option<String>,

    #[serde(default)]
    pub implements: Vec<String>,

    #[serde(default)]
    pub members: Vec<MemberDefinition>,

    pub mappings: Option<Vec<MappingDefinition>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionKind {
    #[default]
    Class,
    Interface,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberDefinition {
    pub name: String,

    #[serde(rename = "type")]
    pub ty: String,

    #[serde(default)]
    pub unique: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingDefinition {
    pub message: String,
    pub property: String,
    pub to_saga: String,
}

/// A loaded manifest: the populated catalog plus the sagas and finders it
/// names
#[derive(Debug, Clone)]
pub struct SagaManifest {
    pub catalog: TypeCatalog,
    pub sagas: Vec<TypeKey>,
    pub finders: Vec<TypeKey>,
}

impl SagaManifest {
    /// Load a manifest from a YAML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read type manifest: {}", path.display()))?;

        Self::from_yaml(&content).with_context(|| format!("Invalid type manifest: {}", path.display()))
    }

    /// Parse and resolve a manifest
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let file: ManifestFile = serde_yaml::from_str(content).context("Failed to parse type manifest YAML")?;
        Ok(Self::resolve(&file)?)
    }

    pub fn resolve(file: &ManifestFile) -> Result<Self, ConfigurationError> {
        let mut catalog = TypeCatalog::new();
        let mut keys: HashMap<&str, TypeKey> = HashMap::new();

        // Declare every name first so definitions may reference each other
        // in any order.
        for definition in &file.types {
            if keys.contains_key(definition.name.as_str()) || catalog.lookup(&definition.name).is_some() {
                return Err(ConfigurationError::InvalidManifest(format!(
                    "type '{}' is defined more than once",
                    definition.name
                )));
            }

            let builder = match definition.kind {
                DefinitionKind::Class => catalog.define(definition.name.clone()),
                DefinitionKind::Interface => catalog.define_interface(definition.name.clone()),
            };
            let key = builder.generic_params(definition.generic_params.len()).key();
            keys.insert(definition.name.as_str(), key);
        }

        for definition in &file.types {
            let key = keys[definition.name.as_str()];
            let parser = TypeParser {
                catalog: &catalog,
                params: &definition.generic_params,
            };

            let base = definition.base.as_deref().map(|b| parser.parse(b)).transpose()?;
            let interfaces = definition
                .implements
                .iter()
                .map(|i| parser.parse(i))
                .collect::<Result<Vec<_>, _>>()?;
            let members = definition
                .members
                .iter()
                .map(|m| {
                    Ok(MemberDescriptor {
                        name: m.name.clone(),
                        ty: parser.parse(&m.ty)?,
                        unique: m.unique,
                    })
                })
                .collect::<Result<Vec<_>, ConfigurationError>>()?;
            let mappings = definition
                .mappings
                .as_ref()
                .map(|mappings| {
                    mappings
                        .iter()
                        .map(|m| {
                            Ok(MessageMapping {
                                message: parser.lookup(&m.message)?,
                                message_property: m.property.clone(),
                                saga_property: m.to_saga.clone(),
                            })
                        })
                        .collect::<Result<Vec<_>, ConfigurationError>>()
                })
                .transpose()?;

            if let Some(descriptor) = catalog.get_mut(key) {
                descriptor.base = base;
                descriptor.interfaces = interfaces;
                descriptor.members = members;
                descriptor.mappings = mappings;
            }
        }

        let lookup_all = |names: &[String]| -> Result<Vec<TypeKey>, ConfigurationError> {
            names
                .iter()
                .map(|name| {
                    catalog
                        .lookup(name)
                        .ok_or_else(|| ConfigurationError::UnknownType { name: name.clone() })
                })
                .collect()
        };

        let sagas = match &file.sagas {
            Some(names) => lookup_all(names)?,
            None => discover_sagas(&catalog),
        };
        let finders = lookup_all(&file.finders)?;

        Ok(Self {
            catalog,
            sagas,
            finders,
        })
    }

    /// Saga metadata for every saga in the manifest
    pub fn metadata(&self) -> Result<SagaMetadataCollection, ConfigurationError> {
        let conventions = Conventions::new(self.catalog.well_known());
        SagaMetadataCollection::initialize(&self.catalog, &self.sagas, &self.finders, &conventions)
    }
}

fn discover_sagas(catalog: &TypeCatalog) -> Vec<TypeKey> {
    let saga = catalog.well_known().saga;
    catalog
        .types()
        .filter(|(key, t)| *key != saga && t.generic_params == 0)
        .filter(|(key, _)| catalog.closing_type_arguments(*key, saga).is_some())
        .map(|(key, _)| key)
        .collect()
}

/// Parses `Name` and `Name<Arg, Other<Nested>>`
struct TypeParser<'a> {
    catalog: &'a TypeCatalog,
    params: &'a [String],
}

impl TypeParser<'_> {
    fn parse(&self, text: &str) -> Result<TypeExpr, ConfigurationError> {
        let (expr, rest) = self.parse_expr(text)?;
        if !rest.trim().is_empty() {
            return Err(invalid_expr(text));
        }
        Ok(expr)
    }

    fn parse_expr<'t>(&self, text: &'t str) -> Result<(TypeExpr, &'t str), ConfigurationError> {
        let text = text.trim_start();
        let end = text
            .find(|c: char| matches!(c, '<' | '>' | ','))
            .unwrap_or(text.len());
        let name = text[..end].trim();
        if name.is_empty() {
            return Err(invalid_expr(text));
        }
        let mut rest = &text[end..];

        if let Some(index) = self.params.iter().position(|p| p == name) {
            return Ok((TypeExpr::Param(index), rest));
        }

        let key = self.lookup(name)?;
        let mut args = Vec::new();

        if let Some(after_open) = rest.strip_prefix('<') {
            rest = after_open;
            loop {
                let (arg, after_arg) = self.parse_expr(rest)?;
                args.push(arg);
                let after_arg = after_arg.trim_start();

                if let Some(next) = after_arg.strip_prefix(',') {
                    rest = next;
                } else if let Some(next) = after_arg.strip_prefix('>') {
                    rest = next;
                    break;
                } else {
                    return Err(invalid_expr(text));
                }
            }
        }

        Ok((TypeExpr::generic(key, args), rest))
    }

    fn lookup(&self, name: &str) -> Result<TypeKey, ConfigurationError> {
        self.catalog.lookup(name).ok_or_else(|| ConfigurationError::UnknownType {
            name: name.to_string(),
        })
    }
}

fn invalid_expr(text: &str) -> ConfigurationError {
    ConfigurationError::InvalidManifest(format!("cannot parse type expression '{}'", text))
}
