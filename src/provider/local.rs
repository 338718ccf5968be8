//! Local filesystem provider.
//!
//! Each resource is materialised as a JSON document at
//! `<root>/<type>/<name>.json`. This gives the CLI a real, inspectable remote
//! system without any cloud account.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::error::{ProviderError, ProviderResult};
use crate::graph::{Outputs, PropertyMap, ResourceId, Value};

use super::{Provider, TypeDescriptor};

/// Document written for every managed resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ResourceDocument {
    resource: ResourceId,
    outputs: Outputs,
    written_at: DateTime<Utc>,
}

/// Provider storing resources as JSON files.
#[derive(Debug, Clone)]
pub struct LocalProvider {
    /// Resource type handled by this provider.
    descriptor: TypeDescriptor,
    /// Root directory shared by every type.
    root: PathBuf,
}

impl LocalProvider {
    /// Creates a provider for `descriptor` writing under `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, descriptor: TypeDescriptor) -> Self {
        Self {
            descriptor,
            root: root.into(),
        }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the document backing `id`.
    #[must_use]
    pub fn document_path(&self, id: &ResourceId) -> PathBuf {
        self.root.join(&id.type_name).join(format!("{}.json", id.name))
    }

    async fn read_document(&self, id: &ResourceId) -> ProviderResult<ResourceDocument> {
        let path = self.document_path(id);
        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| classify_io(&path, &e))?;
        serde_json::from_str(&content)
            .map_err(|e| ProviderError::permanent(format!("{} is not a resource document: {e}", path.display())))
    }

    async fn write_document(&self, id: &ResourceId, outputs: &Outputs) -> ProviderResult<()> {
        let path = self.document_path(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| classify_io(parent, &e))?;
        }

        let document = ResourceDocument {
            resource: id.clone(),
            outputs: outputs.clone(),
            written_at: Utc::now(),
        };
        let content = serde_json::to_string_pretty(&document)
            .map_err(|e| ProviderError::permanent(format!("Failed to serialize {id}: {e}")))?;

        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| classify_io(&temp_path, &e))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| classify_io(&temp_path, &e))?;
        file.sync_all()
            .await
            .map_err(|e| classify_io(&temp_path, &e))?;
        fs::rename(&temp_path, &path)
            .await
            .map_err(|e| classify_io(&path, &e))?;

        debug!("Wrote {}", path.display());
        Ok(())
    }

    fn outputs_for(&self, id: &ResourceId, properties: &PropertyMap, physical_id: Value) -> Outputs {
        let mut outputs = properties.clone();
        outputs.insert("id".to_string(), physical_id);
        outputs.insert(
            "path".to_string(),
            Value::String(self.document_path(id).display().to_string()),
        );
        outputs
    }
}

fn classify_io(path: &Path, error: &std::io::Error) -> ProviderError {
    let message = format!("{}: {error}", path.display());
    match error.kind() {
        ErrorKind::NotFound => ProviderError::not_found(message),
        ErrorKind::PermissionDenied | ErrorKind::InvalidInput | ErrorKind::InvalidData => {
            ProviderError::permanent(message)
        }
        _ => ProviderError::transient(message),
    }
}

#[async_trait]
impl Provider for LocalProvider {
    fn descriptor(&self) -> &TypeDescriptor {
        &self.descriptor
    }

    async fn create(&self, id: &ResourceId, properties: &PropertyMap) -> ProviderResult<Outputs> {
        let uuid = Uuid::new_v4().simple().to_string();
        let physical_id = Value::String(format!("{}-{}", id.type_name, &uuid[..12]));
        let outputs = self.outputs_for(id, properties, physical_id);
        self.write_document(id, &outputs).await?;
        Ok(outputs)
    }

    async fn read(&self, id: &ResourceId, _outputs: &Outputs) -> ProviderResult<Outputs> {
        Ok(self.read_document(id).await?.outputs)
    }

    async fn update(
        &self,
        id: &ResourceId,
        _prior: &Outputs,
        properties: &PropertyMap,
    ) -> ProviderResult<Outputs> {
        let existing = self.read_document(id).await?;
        let physical_id = existing.outputs.get("id").cloned().unwrap_or(Value::Null);
        let outputs = self.outputs_for(id, properties, physical_id);
        self.write_document(id, &outputs).await?;
        Ok(outputs)
    }

    async fn delete(&self, id: &ResourceId, outputs: &Outputs) -> ProviderResult<()> {
        let path = self.document_path(id);
        let current = self.read_document(id).await?;
        if let Some(physical_id) = outputs.get("id")
            && current.outputs.get("id") != Some(physical_id)
        {
            // The document now belongs to a replacement object.
            return Err(ProviderError::not_found(format!(
                "{id} ({physical_id}) was superseded"
            )));
        }

        fs::remove_file(&path)
            .await
            .map_err(|e| classify_io(&path, &e))?;
        debug!("Removed {}", path.display());
        Ok(())
    }
}
