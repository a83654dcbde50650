//! Bindings manifests
//!
//! A manifest declares native libraries and their functions in TOML:
//!
//! ```toml
//! [[library]]
//! name = "store"
//! path = "lib/libstore.so"
//! default-protocol = "non-zero"
//! default-finalizer = "store_close"
//!
//! [[library.function]]
//! symbol = "store_open"
//! params = [{ name = "path", type = "text" }]
//! returns = { type = "handle", ownership = "owned" }
//! protocol = "null-pointer"
//! ```
//!
//! A function whose declaration is invalid is rejected on its own: the
//! rest of the manifest is still registered.

use crate::ffi::declaration::{DeclError, DeclId, DeclarationTableBuilder};
use crate::ffi::types::{
    ErrorProtocol, ForeignDeclaration, LibraryDeclaration, LibraryId, ParameterSpec, ReturnSpec,
    SymbolName,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Manifest errors
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse manifest {path}: {error}")]
    Parse {
        path: PathBuf,
        #[source]
        error: toml::de::Error,
    },

    #[error("invalid declaration in manifest {path}: {source}")]
    Declaration {
        path: PathBuf,
        #[source]
        source: DeclError,
    },
}

/// A parsed bindings manifest
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BindingsManifest {
    #[serde(default)]
    pub library: Vec<LibraryManifest>,

    /// Directory relative library paths are resolved against
    #[serde(skip)]
    base_dir: Option<PathBuf>,
}

/// `[[library]]` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct LibraryManifest {
    pub name: LibraryId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_protocol: Option<ErrorProtocol>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_finalizer: Option<SymbolName>,
    #[serde(default)]
    pub function: Vec<FunctionManifest>,
}

/// `[[library.function]]` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FunctionManifest {
    pub symbol: SymbolName,
    /// Native export, when it differs from `symbol`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_name: Option<SymbolName>,
    #[serde(default)]
    pub params: Vec<ParameterSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returns: Option<ReturnSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<ErrorProtocol>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalizer: Option<SymbolName>,
}

impl FunctionManifest {
    fn to_declaration(&self, library: &LibraryId) -> ForeignDeclaration {
        ForeignDeclaration {
            library: library.clone(),
            symbol: self.symbol.clone(),
            link_name: self.link_name.clone(),
            parameters: self.params.clone(),
            return_spec: self.returns.clone().unwrap_or_default(),
            error_protocol: self.protocol,
            finalizer: self.finalizer.clone(),
        }
    }
}

impl BindingsManifest {
    /// Load a manifest file
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut manifest = Self::parse(&content).map_err(|error| ManifestError::Parse {
            path: path.to_path_buf(),
            error,
        })?;
        manifest.base_dir = path.parent().map(Path::to_path_buf);
        Ok(manifest)
    }

    /// Parse manifest text; relative paths stay relative
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Explicit library files, resolved against the manifest's directory
    pub fn library_paths(&self) -> Vec<(LibraryId, PathBuf)> {
        self.library
            .iter()
            .filter_map(|lib| {
                let path = lib.path.as_ref()?;
                let resolved = match &self.base_dir {
                    Some(base) if path.is_relative() => base.join(path),
                    _ => path.clone(),
                };
                Some((lib.name.clone(), resolved))
            })
            .collect()
    }

    /// Register every library and function of this manifest
    ///
    /// Invalid declarations are logged and skipped; the others are
    /// registered regardless.
    pub fn apply(&self, builder: &mut DeclarationTableBuilder) -> Applied {
        let mut applied = Applied::default();
        for lib in &self.library {
            let mut defaults = LibraryDeclaration::new(lib.name.clone())
                .default_protocol(lib.default_protocol.unwrap_or_default());
            if let Some(finalizer) = &lib.default_finalizer {
                defaults = defaults.default_finalizer(finalizer.clone());
            }
            builder.declare_library(defaults);

            for function in &lib.function {
                match builder.register(function.to_declaration(&lib.name)) {
                    Ok(id) => applied.registered.push(id),
                    Err(e) => {
                        tracing::error!(
                            library = %lib.name,
                            symbol = %function.symbol,
                            error = %e,
                            "rejected foreign declaration"
                        );
                        applied.rejected.push(e);
                    }
                }
            }
        }
        applied
    }
}

/// Outcome of registering a manifest
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Applied {
    pub registered: Vec<DeclId>,
    pub rejected: Vec<DeclError>,
}

impl Applied {
    /// Rejections as errors attributed to the manifest file
    pub fn rejected_in(self, path: &Path) -> Vec<ManifestError> {
        self.rejected
            .into_iter()
            .map(|source| ManifestError::Declaration {
                path: path.to_path_buf(),
                source,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::declaration::DeclarationTable;
    use crate::ffi::types::{Direction, LogicalType, Ownership};
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::TempDir;

    const STORE: &str = r#"
[[library]]
name = "store"
path = "lib/libstore.so"
default-protocol = "non-zero"
default-finalizer = "store_close"

[[library.function]]
symbol = "store_open"
params = [{ name = "path", type = "text" }]
returns = { type = "handle", ownership = "owned" }
protocol = "null-pointer"

[[library.function]]
symbol = "store_get"
params = [
    { name = "db", type = "handle", ownership = "borrowed" },
    { name = "key", type = "text" },
    { name = "value", type = "i64", direction = "out" },
]
returns = { type = "i32" }
"#;

    #[test]
    fn test_parse_manifest() {
        let manifest = BindingsManifest::parse(STORE).unwrap();
        assert_eq!(manifest.library.len(), 1);

        let lib = &manifest.library[0];
        assert_eq!(lib.default_protocol, Some(ErrorProtocol::NonZero));
        assert_eq!(lib.function.len(), 2);

        let get = &lib.function[1];
        assert_eq!(get.params[0].ownership, Ownership::Borrowed);
        assert_eq!(get.params[2].direction, Direction::Out);
        assert_eq!(get.params[2].logical_type, LogicalType::I64);
    }

    #[test]
    fn test_apply_registers_with_defaults() {
        let manifest = BindingsManifest::parse(STORE).unwrap();
        let mut builder = DeclarationTable::builder();
        let applied = manifest.apply(&mut builder);
        assert!(applied.rejected.is_empty());
        let ids = applied.registered;
        let table = builder.build();

        let open = table.declaration(ids[0]).unwrap();
        assert_eq!(open.error_protocol(), ErrorProtocol::NullPointer);
        assert_eq!(open.finalizer, Some(SymbolName::new("store_close")));

        let get = table.declaration(ids[1]).unwrap();
        assert_eq!(get.error_protocol(), ErrorProtocol::NonZero);
        assert_eq!(
            table.plan_for(ids[1]).unwrap().signature(),
            "(c_handle,c_text)->c_int64 !non-zero"
        );
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = BindingsManifest::parse("[[library]]\nname = \"x\"\nversion = 2\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_resolves_relative_paths() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bindings.toml");
        fs::write(&path, STORE).unwrap();

        let manifest = BindingsManifest::load(&path).unwrap();
        assert_eq!(
            manifest.library_paths(),
            vec![(LibraryId::new("store"), dir.path().join("lib/libstore.so"))]
        );
    }

    #[test]
    fn test_load_reports_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[[library]]\nname = 3\n").unwrap();

        let err = BindingsManifest::load(&path).unwrap_err();
        assert!(matches!(err, ManifestError::Parse { .. }));
        assert!(err.to_string().contains("broken.toml"));
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.downcast_ref::<toml::de::Error>().is_some());

        let direct: toml::de::Error =
            BindingsManifest::parse("[[library]]\nname = 3\n").unwrap_err();
        assert_eq!(direct.to_string(), source.to_string());
    }

    #[test]
    fn test_invalid_declaration_rejected_alone() {
        let manifest = BindingsManifest::parse(
            r#"
[[library]]
name = "x"

[[library.function]]
symbol = "bad"
returns = { type = "handle", ownership = "borrowed" }

[[library.function]]
symbol = "also_bad"
returns = { type = "bytes" }

[[library.function]]
symbol = "good"
returns = { type = "i32" }
"#,
        )
        .unwrap();
        let mut builder = DeclarationTable::builder();
        let applied = manifest.apply(&mut builder);
        let table = builder.build();

        assert_eq!(applied.registered.len(), 1);
        assert_eq!(
            table.lookup(&LibraryId::new("x"), &SymbolName::new("good")),
            Some(applied.registered[0])
        );
        assert_eq!(table.len(), 1);
        assert!(matches!(
            applied.rejected[0],
            DeclError::InvalidOwnershipCombination { .. }
        ));

        let errors = applied.rejected_in(Path::new("x.toml"));
        assert_eq!(errors.len(), 2);
        assert!(matches!(
            &errors[1],
            ManifestError::Declaration {
                source: DeclError::UnsupportedReturn { .. },
                ..
            }
        ));
        assert!(errors[0].to_string().contains("x.toml"));
    }

    #[test]
    fn test_link_name_field() {
        let manifest = BindingsManifest::parse(
            r#"
[[library]]
name = "z"

[[library.function]]
symbol = "crc"
link-name = "crc32"
params = [{ name = "data", type = "bytes" }, { name = "len", type = "size" }]
returns = { type = "u32" }
"#,
        )
        .unwrap();
        let mut builder = DeclarationTable::builder();
        let id = manifest.apply(&mut builder).registered[0];
        let table = builder.build();

        let decl = table.declaration(id).unwrap();
        assert_eq!(decl.symbol.as_str(), "crc");
        assert_eq!(decl.native_symbol().as_str(), "crc32");
    }
}
