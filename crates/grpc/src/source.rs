//! Descriptor sources: where method schemas come from

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Command;

use async_trait::async_trait;
use prost::Message;
use prost_reflect::{DescriptorPool, ExtensionDescriptor, FileDescriptor};
use prost_types::FileDescriptorSet;
use tracing::debug;

use trpc_common::{Error, Result, SchemaImports};

/// Provider of protobuf schema information
#[async_trait]
pub trait DescriptorSource: Send {
    /// Fully-qualified names of the services this source exposes
    async fn list_services(&mut self) -> Result<Vec<String>>;

    /// The file defining `symbol`, or `None` when the source does not know it
    async fn find_symbol(&mut self, symbol: &str) -> Result<Option<FileDescriptor>>;

    /// Extensions of the message `type_name` known to this source
    async fn all_extensions_for_type(&mut self, type_name: &str) -> Result<Vec<ExtensionDescriptor>>;
}

/// File in `pool` that defines a service, message, enum or extension named `symbol`
pub fn file_containing(pool: &DescriptorPool, symbol: &str) -> Option<FileDescriptor> {
    pool.get_service_by_name(symbol)
        .map(|s| s.parent_file())
        .or_else(|| pool.get_message_by_name(symbol).map(|m| m.parent_file()))
        .or_else(|| pool.get_enum_by_name(symbol).map(|e| e.parent_file()))
        .or_else(|| pool.get_extension_by_name(symbol).map(|e| e.parent_file()))
}

/// Descriptor source built from protoset files and compiled proto sources
#[derive(Debug, Clone, Default)]
pub struct FileSource {
    pool: DescriptorPool,
}

impl FileSource {
    pub fn from_pool(pool: DescriptorPool) -> Self {
        Self { pool }
    }

    /// Load every schema file a specification imports
    pub fn load(imports: &SchemaImports) -> Result<Self> {
        let mut pool = DescriptorPool::new();
        for protoset in &imports.proto_sets {
            add_set(&mut pool, read_protoset(Path::new(protoset))?)?;
        }
        if !imports.proto_files.is_empty() {
            add_set(&mut pool, compile_protos(&imports.import_paths, &imports.proto_files)?)?;
        }
        debug!("Loaded {} schema file(s) from disk", pool.files().count());
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &DescriptorPool {
        &self.pool
    }
}

#[async_trait]
impl DescriptorSource for FileSource {
    async fn list_services(&mut self) -> Result<Vec<String>> {
        Ok(self.pool.services().map(|s| s.full_name().to_string()).collect())
    }

    async fn find_symbol(&mut self, symbol: &str) -> Result<Option<FileDescriptor>> {
        Ok(file_containing(&self.pool, symbol))
    }

    async fn all_extensions_for_type(&mut self, type_name: &str) -> Result<Vec<ExtensionDescriptor>> {
        Ok(self
            .pool
            .get_message_by_name(type_name)
            .map(|m| m.extensions().collect())
            .unwrap_or_default())
    }
}

fn add_set(pool: &mut DescriptorPool, set: FileDescriptorSet) -> Result<()> {
    let files: Vec<_> = set
        .file
        .into_iter()
        .filter(|file| pool.get_file_by_name(file.name()).is_none())
        .collect();
    pool.add_file_descriptor_protos(files)
        .map_err(|e| Error::Schema(e.to_string()))
}

fn read_protoset(path: &Path) -> Result<FileDescriptorSet> {
    let bytes = std::fs::read(path)
        .map_err(|e| Error::Schema(format!("Could not read protoset {}: {e}", path.display())))?;
    FileDescriptorSet::decode(bytes.as_slice())
        .map_err(|e| Error::Schema(format!("Could not decode protoset {}: {e}", path.display())))
}

/// Compile proto sources with `protoc` (or `$PROTOC`) into a descriptor set
fn compile_protos(import_paths: &[String], files: &[String]) -> Result<FileDescriptorSet> {
    let protoc = std::env::var_os("PROTOC").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("protoc"));
    let out = tempfile::NamedTempFile::new()?;

    let mut command = Command::new(&protoc);
    command
        .arg("--include_imports")
        .arg(format!("--descriptor_set_out={}", out.path().display()));
    for dir in import_paths {
        command.arg(format!("--proto_path={dir}"));
    }
    command.args(files);
    debug!("Compiling proto sources: {:?}", command);

    let output = command
        .output()
        .map_err(|e| Error::Schema(format!("Could not run {}: {e}", protoc.display())))?;
    if !output.status.success() {
        return Err(Error::Schema(format!(
            "Could not parse given files: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    read_protoset(out.path())
}

/// Reflection first, files as fallback
///
/// Symbol lookups fall back to the file source on a miss. Extension lookups
/// merge both, keeping the reflected extension when tag numbers collide.
/// Service listing asks the live server only.
pub struct CompositeSource<R, F> {
    reflection: R,
    files: F,
}

impl<R, F> CompositeSource<R, F> {
    pub fn new(reflection: R, files: F) -> Self {
        Self { reflection, files }
    }
}

#[async_trait]
impl<R, F> DescriptorSource for CompositeSource<R, F>
where
    R: DescriptorSource,
    F: DescriptorSource,
{
    async fn list_services(&mut self) -> Result<Vec<String>> {
        self.reflection.list_services().await
    }

    async fn find_symbol(&mut self, symbol: &str) -> Result<Option<FileDescriptor>> {
        match self.reflection.find_symbol(symbol).await {
            Ok(Some(file)) => Ok(Some(file)),
            Ok(None) => self.files.find_symbol(symbol).await,
            Err(err) => match self.files.find_symbol(symbol).await {
                Ok(Some(file)) => {
                    debug!("Reflection lookup of {} failed ({}), using file source", symbol, err);
                    Ok(Some(file))
                }
                _ => Err(err),
            },
        }
    }

    async fn all_extensions_for_type(&mut self, type_name: &str) -> Result<Vec<ExtensionDescriptor>> {
        let reflected = self.reflection.all_extensions_for_type(type_name).await.unwrap_or_else(|err| {
            debug!("Reflection could not list extensions of {}: {}", type_name, err);
            Vec::new()
        });
        let from_files = self.files.all_extensions_for_type(type_name).await?;

        let mut seen = HashSet::new();
        Ok(reflected
            .into_iter()
            .chain(from_files)
            .filter(|ext| seen.insert(ext.number()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost_types::field_descriptor_proto::{Label, Type};
    use prost_types::{
        descriptor_proto::ExtensionRange, DescriptorProto, FieldDescriptorProto, FileDescriptorProto,
        MethodDescriptorProto, ServiceDescriptorProto,
    };
    use std::io::Write;

    /// `test.Svc/Call` plus extensions of `test.Req` named `<prefix>_<number>`
    fn file(service: &str, prefix: &str, extensions: &[i32]) -> FileDescriptorProto {
        FileDescriptorProto {
            name: Some("test.proto".into()),
            package: Some("test".into()),
            message_type: vec![DescriptorProto {
                name: Some("Req".into()),
                extension_range: vec![ExtensionRange { start: Some(100), end: Some(200), ..Default::default() }],
                ..Default::default()
            }],
            service: vec![ServiceDescriptorProto {
                name: Some(service.into()),
                method: vec![MethodDescriptorProto {
                    name: Some("Call".into()),
                    input_type: Some(".test.Req".into()),
                    output_type: Some(".test.Req".into()),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            extension: extensions
                .iter()
                .map(|n| FieldDescriptorProto {
                    name: Some(format!("{prefix}_{n}")),
                    number: Some(*n),
                    label: Some(Label::Optional as i32),
                    r#type: Some(Type::String as i32),
                    extendee: Some(".test.Req".into()),
                    ..Default::default()
                })
                .collect(),
            syntax: Some("proto2".into()),
            ..Default::default()
        }
    }

    fn source(service: &str, prefix: &str, extensions: &[i32]) -> FileSource {
        let mut pool = DescriptorPool::new();
        pool.add_file_descriptor_proto(file(service, prefix, extensions)).unwrap();
        FileSource::from_pool(pool)
    }

    /// Reflection stand-in that is unreachable
    struct Offline;

    #[async_trait]
    impl DescriptorSource for Offline {
        async fn list_services(&mut self) -> Result<Vec<String>> {
            Err(Error::Schema("unavailable".into()))
        }

        async fn find_symbol(&mut self, _symbol: &str) -> Result<Option<FileDescriptor>> {
            Err(Error::Schema("unavailable".into()))
        }

        async fn all_extensions_for_type(&mut self, _type_name: &str) -> Result<Vec<ExtensionDescriptor>> {
            Err(Error::Schema("unavailable".into()))
        }
    }

    #[tokio::test]
    async fn test_symbol_prefers_reflection() {
        let mut composite = CompositeSource::new(source("Svc", "r", &[]), source("Svc", "f", &[100]));
        let file = composite.find_symbol("test.Svc").await.unwrap().unwrap();
        assert!(file.parent_pool().get_extension_by_name("test.f_100").is_none());
    }

    #[tokio::test]
    async fn test_symbol_falls_back_to_files() {
        let mut composite = CompositeSource::new(source("Live", "r", &[]), source("Hidden", "f", &[]));
        assert!(composite.find_symbol("test.Hidden").await.unwrap().is_some());
        assert!(composite.find_symbol("test.Missing").await.unwrap().is_none());

        let mut offline = CompositeSource::new(Offline, source("Hidden", "f", &[]));
        assert!(offline.find_symbol("test.Hidden").await.unwrap().is_some());
        assert!(offline.find_symbol("test.Missing").await.is_err());
    }

    #[tokio::test]
    async fn test_extensions_merge_by_tag_reflection_wins() {
        let mut composite = CompositeSource::new(source("Svc", "r", &[100, 102]), source("Svc", "f", &[100, 101]));
        let mut names: Vec<String> = composite
            .all_extensions_for_type("test.Req")
            .await
            .unwrap()
            .iter()
            .map(|ext| ext.name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["f_101", "r_100", "r_102"]);
    }

    #[tokio::test]
    async fn test_services_listed_from_reflection_only() {
        let mut composite = CompositeSource::new(source("Live", "r", &[]), source("Hidden", "f", &[]));
        assert_eq!(composite.list_services().await.unwrap(), vec!["test.Live"]);
    }

    #[test]
    fn test_protoset_files_load() {
        let set = FileDescriptorSet { file: vec![file("Svc", "p", &[110])] };
        let mut protoset = tempfile::NamedTempFile::new().unwrap();
        protoset.write_all(&set.encode_to_vec()).unwrap();

        let imports = SchemaImports {
            proto_sets: vec![protoset.path().display().to_string()],
            ..Default::default()
        };
        let loaded = FileSource::load(&imports).unwrap();
        assert!(file_containing(loaded.pool(), "test.Svc").is_some());
        assert!(file_containing(loaded.pool(), "test.p_110").is_some());
        assert!(file_containing(loaded.pool(), "test.Nope").is_none());
    }

    #[test]
    fn test_unreadable_protoset_is_schema_error() {
        let imports = SchemaImports { proto_sets: vec!["/nonexistent/all.pb".into()], ..Default::default() };
        let err = FileSource::load(&imports).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }
}
