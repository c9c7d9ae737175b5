//! Shared row-to-model conversions
//!
//! Used by every adapter for the summary projection, whether the last event
//! was extracted by the database or by decoding the document in process.

use anyhow::{Context, Result};
use at_common::{timestamp, AuditAction, AuditSummary};
use at_core::{DocumentCodec, DocumentFilter, StoredDocument};

/// Build a summary from the last event's raw attributes
pub fn summary_from_parts(
    source_type: String,
    source_key: String,
    action: Option<String>,
    ts: Option<String>,
    actor: Option<String>,
) -> Result<AuditSummary> {
    let last_action = action
        .map(|a| a.parse::<AuditAction>())
        .transpose()
        .with_context(|| format!("last action of {}#{}", source_type, source_key))?;
    let last_timestamp = ts
        .map(|t| timestamp::parse(&t))
        .transpose()
        .with_context(|| format!("last timestamp of {}#{}", source_type, source_key))?;

    Ok(AuditSummary {
        source_type,
        source_key,
        last_action,
        last_timestamp,
        last_actor: actor,
    })
}

/// Summary computed by decoding each document
pub fn summarize_decoded(codec: &DocumentCodec, rows: Vec<StoredDocument>) -> Result<Vec<AuditSummary>> {
    rows.into_iter()
        .map(|row| {
            let document = codec.decode(&row.document)?;
            let last = document.last();
            Ok(AuditSummary {
                source_type: row.identity.source_type,
                source_key: row.identity.source_key,
                last_action: last.map(|e| e.action),
                last_timestamp: last.map(|e| e.timestamp),
                last_actor: last.map(|e| e.actor.clone()),
            })
        })
        .collect()
}

/// Keep rows whose decoded documents satisfy `filter`
pub fn filter_decoded(
    codec: &DocumentCodec,
    rows: Vec<StoredDocument>,
    filter: &DocumentFilter,
) -> Result<Vec<StoredDocument>> {
    let mut matching = Vec::new();
    for row in rows {
        let document = codec.decode(&row.document)?;
        if filter.matches(document.events()) {
            matching.push(row);
        }
    }
    Ok(matching)
}

/// Clamp a page size for SQL `LIMIT`
pub fn page_limit(take: u64) -> i64 {
    i64::try_from(take).unwrap_or(i64::MAX)
}
