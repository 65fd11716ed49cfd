use chrono::{NaiveDateTime, Utc};
use tracing::debug;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::error::{EfapsError, Result};
use crate::value::{Instance, Locale, Value};

/// Who is executing a statement, in which locale and at which point in time.
/// Passed explicitly into every encode and execute call.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    actor: i64,
    locale: Locale,
    now: Option<NaiveDateTime>,
    audit_override: bool,
}

impl ExecutionContext {
    pub fn new(actor: i64) -> Self {
        Self {
            actor,
            locale: Locale::default(),
            now: None,
            audit_override: false,
        }
    }
    pub fn with_locale(mut self, locale: Locale) -> Self {
        self.locale = locale;
        self
    }
    /// Pins the clock used for created and modified timestamps.
    pub fn at(mut self, now: NaiveDateTime) -> Self {
        self.now = Some(now);
        self
    }
    /// Lets values supplied for creator, modifier, created and modified
    /// attributes win over the actor and clock of this context.
    pub fn with_audit_override(mut self) -> Self {
        self.audit_override = true;
        self
    }
    pub fn actor(&self) -> i64 {
        self.actor
    }
    pub fn locale(&self) -> &Locale {
        &self.locale
    }
    pub fn now(&self) -> NaiveDateTime {
        self.now.unwrap_or_else(|| Utc::now().naive_utc())
    }
    pub fn audit_override(&self) -> bool {
        self.audit_override
    }
}

// ------------- Programs -------------
/// Server side code evaluated per instance by an `exec` select.
pub trait ExecProgram: Send + Sync {
    fn evaluate(&self, instance: &Instance, ctx: &ExecutionContext) -> Result<Value>;
}

impl<F> ExecProgram for F
where
    F: Fn(&Instance, &ExecutionContext) -> Result<Value> + Send + Sync,
{
    fn evaluate(&self, instance: &Instance, ctx: &ExecutionContext) -> Result<Value> {
        self(instance, ctx)
    }
}

#[derive(Default)]
pub struct ProgramRegistry {
    programs: RwLock<HashMap<String, Arc<dyn ExecProgram>>>,
}

impl ProgramRegistry {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn register(&self, name: &str, program: Arc<dyn ExecProgram>) -> Result<()> {
        debug!(program = name, "registering exec program");
        self.programs.write()?.insert(name.to_string(), program);
        Ok(())
    }
    pub fn get(&self, name: &str) -> Result<Arc<dyn ExecProgram>> {
        self.programs
            .read()?
            .get(name)
            .cloned()
            .ok_or_else(|| EfapsError::Execution(format!("no program registered as '{}'", name)))
    }
}

impl fmt::Debug for ProgramRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let names: Vec<String> = match self.programs.read() {
            Ok(programs) => programs.keys().cloned().collect(),
            Err(_) => Vec::new(),
        };
        f.debug_struct("ProgramRegistry").field("programs", &names).finish()
    }
}
