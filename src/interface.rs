//! Shared entry point for callers that submit EQL statements from several threads.
//!
//! The interface owns the database behind an `Arc`, fills in the actor and locale
//! a request leaves out, and numbers every submitted statement so log lines of
//! one request can be correlated.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::construct::Database;
use crate::context::ExecutionContext;
use crate::error::Result;
use crate::statement::{Engine, StatementResult};
use crate::value::Locale;

/// Opaque statement identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatementId(u64);

impl StatementId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// A finished statement.
pub struct Completed {
    pub id: StatementId,
    pub elapsed: Duration,
    pub result: Result<StatementResult>,
}

pub struct EqlInterface {
    db: Arc<Database>,
    next_id: AtomicU64,
    default_actor: i64,
    default_locale: String,
}

impl EqlInterface {
    pub fn new(db: Arc<Database>, default_actor: i64, default_locale: &str) -> Self {
        Self {
            db,
            next_id: AtomicU64::new(0),
            default_actor,
            default_locale: default_locale.to_string(),
        }
    }
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }
    fn allocate_id(&self) -> StatementId {
        StatementId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }
    pub fn context(&self, actor: Option<i64>, locale: Option<&str>) -> ExecutionContext {
        ExecutionContext::new(actor.unwrap_or(self.default_actor))
            .with_locale(Locale::from_tag(locale.unwrap_or(&self.default_locale)))
    }
    /// Runs one statement on the calling thread.
    pub fn run(&self, statement: &str, actor: Option<i64>, locale: Option<&str>) -> Completed {
        let id = self.allocate_id();
        let ctx = self.context(actor, locale);
        let started = Instant::now();
        debug!(id = id.0, actor = ctx.actor(), locale = ctx.locale().tag(), "statement submitted");
        let result = Engine::new(&self.db).execute(statement, &ctx);
        Completed {
            id,
            elapsed: started.elapsed(),
            result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::construct::PersistenceMode;
    use crate::error::EfapsError;

    fn interface() -> EqlInterface {
        let db = Arc::new(Database::new(PersistenceMode::InMemory).unwrap());
        EqlInterface::new(db, 7, "de-DE")
    }

    #[test]
    fn statements_are_numbered_in_submission_order() {
        let iface = interface();
        let first = iface.run("not a statement", None, None);
        let second = iface.run("not a statement", None, None);
        assert_eq!(first.id.value(), 1);
        assert_eq!(second.id.value(), 2);
        assert!(matches!(first.result, Err(EfapsError::Parse { .. })));
    }

    #[test]
    fn requests_fall_back_to_the_defaults() {
        let iface = interface();
        let ctx = iface.context(None, None);
        assert_eq!(ctx.actor(), 7);
        assert_eq!(ctx.locale().tag(), "de-DE");
        let ctx = iface.context(Some(3), Some("en"));
        assert_eq!(ctx.actor(), 3);
        assert_eq!(ctx.locale().tag(), "en");
    }
}
