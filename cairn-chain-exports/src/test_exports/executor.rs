// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use crate::{ActionContext, ActionExecutor, ChainResult, ExecutionResult};
use cairn_hash::Hash;
use cairn_models::name::Name;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Behavior of a scripted action
pub type ActionScript =
    Arc<dyn Fn(&mut dyn ActionContext) -> ChainResult<ExecutionResult> + Send + Sync>;

/// CPU time billed for an action without a script
pub const DEFAULT_SCRIPTED_CPU_US: u32 = 50;

/// Action executor for tests.
/// Scripts are registered per `(receiver, action name)`; other actions succeed and cost
/// `DEFAULT_SCRIPTED_CPU_US`. Every call is recorded.
#[derive(Default)]
pub struct ScriptedActionExecutor {
    scripts: Mutex<BTreeMap<(Name, Name), ActionScript>>,
    calls: Mutex<Vec<(Name, Name)>>,
}

impl std::fmt::Debug for ScriptedActionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedActionExecutor")
            .field("scripts", &self.scripts.lock().keys().collect::<Vec<_>>())
            .field("calls", &self.calls.lock().len())
            .finish()
    }
}

impl ScriptedActionExecutor {
    /// Executor without scripts
    pub fn new() -> Self {
        ScriptedActionExecutor::default()
    }

    /// Run `script` when `receiver` handles `action`
    pub fn on<F>(&self, receiver: Name, action: Name, script: F)
    where
        F: Fn(&mut dyn ActionContext) -> ChainResult<ExecutionResult> + Send + Sync + 'static,
    {
        self.scripts
            .lock()
            .insert((receiver, action), Arc::new(script));
    }

    /// `(receiver, action name)` of every call so far
    pub fn calls(&self) -> Vec<(Name, Name)> {
        self.calls.lock().clone()
    }

    /// Forget the recorded calls
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }
}

impl ActionExecutor for ScriptedActionExecutor {
    fn execute(
        &self,
        _code_hash: &Hash,
        context: &mut dyn ActionContext,
    ) -> ChainResult<ExecutionResult> {
        let key = (context.receiver(), context.action().name);
        self.calls.lock().push(key);
        // the lock must not be held while the script runs
        let script = self.scripts.lock().get(&key).cloned();
        match script {
            Some(script) => script(context),
            None => Ok(ExecutionResult::success(DEFAULT_SCRIPTED_CPU_US)),
        }
    }
}
