//! Unit of Work
//!
//! Atomic commit of entity changes and their audit events within a single
//! store transaction. The host mutates its own rows through the writer's
//! transaction, records changes into the buffer, then commits: buffered
//! events are flushed into the same transaction before it commits. If the
//! flush fails the transaction is rolled back and nothing is persisted.
//!
//! ```ignore
//! let mut uow = storage.begin().await?;
//! sqlx::query("UPDATE products SET price = ? WHERE id = ?")
//!     .bind(12.99)
//!     .bind(42)
//!     .execute(uow.writer_mut().connection())
//!     .await?;
//! auditor.entity_changed(uow.buffer_mut(), Some(&before), Some(&after))?;
//! uow.commit(&auditor, &cancel).await?;
//! ```

use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::auditor::{Auditor, FlushReport};
use crate::buffer::AuditBuffer;
use crate::error::{AuditError, Result};
use crate::repository::TransactionalWriter;

pub struct AuditUnitOfWork<W> {
    writer: W,
    buffer: AuditBuffer,
}

impl<W: TransactionalWriter> AuditUnitOfWork<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            buffer: AuditBuffer::new(),
        }
    }

    /// The transaction-bound writer, for the host's own mutations
    pub fn writer_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn buffer(&self) -> &AuditBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut AuditBuffer {
        &mut self.buffer
    }

    /// Flush buffered events, then commit the transaction
    pub async fn commit(self, auditor: &Auditor, cancel: &CancellationToken) -> Result<FlushReport> {
        let Self { mut writer, buffer } = self;

        let report = match auditor.flush(buffer, &mut writer, cancel).await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Audit flush failed, rolling back");
                if let Err(rollback) = writer.rollback().await {
                    warn!(error = %rollback, "Rollback after failed audit flush also failed");
                }
                return Err(e);
            }
        };

        if cancel.is_cancelled() {
            if let Err(rollback) = writer.rollback().await {
                warn!(error = %rollback, "Rollback after cancellation failed");
            }
            return Err(AuditError::Cancelled);
        }

        writer.commit().await?;
        Ok(report)
    }

    /// Discard buffered events and roll the transaction back
    pub async fn rollback(self) -> Result<()> {
        self.writer.rollback().await?;
        Ok(())
    }
}
