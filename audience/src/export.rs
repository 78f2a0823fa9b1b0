//! Hand-off of audiences to export collaborators.
//!
//! Exporters render files from an [`AudienceSnapshot`]. The snapshot is read in a single store
//! transaction, so an export never observes a half-applied reconciliation.

use std::future::Future;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::error::AudienceResult;
use crate::store::AudienceStore;
use crate::types::{AudienceId, AudienceSnapshot};

/// Reference to a file generated by an [`AudienceExporter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportReference {
    pub audience_id: AudienceId,
    /// Exporter-specific location of the generated file.
    pub location: String,
    pub generated_at: DateTime<Utc>,
}

/// Renders audience snapshots into files.
pub trait AudienceExporter {
    fn export(
        &self,
        snapshot: &AudienceSnapshot,
    ) -> impl Future<Output = AudienceResult<ExportReference>> + Send;
}

/// Reads a consistent snapshot of `audience_id` and hands it to `exporter`.
pub async fn export_audience<St, E>(
    store: &St,
    exporter: &E,
    audience_id: AudienceId,
) -> AudienceResult<ExportReference>
where
    St: AudienceStore + Sync,
    E: AudienceExporter + Sync,
{
    let snapshot = store.get_snapshot(audience_id).await?;
    let reference = exporter.export(&snapshot).await?;

    info!(
        %audience_id,
        members = snapshot.audience.membership.len(),
        location = %reference.location,
        "exported audience"
    );

    Ok(reference)
}
