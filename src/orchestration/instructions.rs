//! Role instructions for worker and QC calls.
//!
//! The executor asks an [`InstructionResolver`] for the system instructions
//! of a role. [`Memoized`] wraps any resolver so every distinct role is
//! resolved once, even when many concurrent tasks share it.

use crate::error::Result;
use crate::olog_debug;
use crate::orchestration::service::CallKind;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

#[async_trait]
pub trait InstructionResolver: Send + Sync {
    /// System instructions for `role` acting in the given step.
    async fn resolve(&self, role: &str, kind: CallKind) -> Result<String>;
}

/// Deterministic instructions built from the role description.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoleTemplates;

#[async_trait]
impl InstructionResolver for RoleTemplates {
    async fn resolve(&self, role: &str, kind: CallKind) -> Result<String> {
        Ok(match kind {
            CallKind::Worker => format!(
                "You are acting as: {role}\n\n\
                 Complete the task you are given. Work directly toward a final \
                 answer, use tools only when they are needed, and do not repeat \
                 steps you have already taken. When retry feedback is present, \
                 address every listed issue and required fix."
            ),
            CallKind::QualityControl => format!(
                "You are acting as: {role}\n\n\
                 You independently verify another agent's output against the \
                 stated criteria. Be strict and specific: list concrete issues \
                 and the fixes required. Respond only in the requested format."
            ),
        })
    }
}

type CacheKey = (CallKind, String);

/// Caches another resolver's answers per (step, role).
pub struct Memoized<R> {
    inner: R,
    cache: Mutex<HashMap<CacheKey, Arc<OnceCell<String>>>>,
}

impl<R: InstructionResolver> Memoized<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Number of distinct roles cached so far.
    pub fn cached(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    fn cell(&self, role: &str, kind: CallKind) -> Arc<OnceCell<String>> {
        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            cache
                .entry((kind, role.to_string()))
                .or_insert_with(|| Arc::new(OnceCell::new())),
        )
    }
}

#[async_trait]
impl<R: InstructionResolver> InstructionResolver for Memoized<R> {
    async fn resolve(&self, role: &str, kind: CallKind) -> Result<String> {
        let cell = self.cell(role, kind);
        let text = cell
            .get_or_try_init(|| async {
                olog_debug!("Instructions: resolving {} role '{}'", kind, role);
                self.inner.resolve(role, kind).await
            })
            .await?;
        Ok(text.clone())
    }
}
