use anyhow::Result;
use rquickjs::{Context, Runtime, Value};
use std::time::{Duration, Instant};
use tracing::debug;

const MEMORY_LIMIT_BYTES: usize = 16 * 1024 * 1024;
const EVAL_DEADLINE: Duration = Duration::from_millis(250);

/// Evaluates page-state object literals that are JavaScript but not JSON.
///
/// Share pages often assign their state as `window.data = {file_list: [...],}`
/// with bare keys, single quotes or trailing commas. Rather than hand-writing a
/// lenient parser, the literal is run through QuickJS and re-serialised with
/// `JSON.stringify`. The runtime has no I/O bindings, a memory cap, and is
/// interrupted if evaluation runs past a short deadline.
pub struct StateEvaluator {
    deadline: Duration,
}

impl StateEvaluator {
    pub fn new() -> Self {
        Self {
            deadline: EVAL_DEADLINE,
        }
    }

    pub fn to_json(&self, literal: &str) -> Result<serde_json::Value> {
        let json = self.stringify(literal)?;
        if json.is_empty() {
            anyhow::bail!("state literal did not serialise to JSON");
        }
        Ok(serde_json::from_str(&json)?)
    }

    fn stringify(&self, literal: &str) -> Result<String> {
        let runtime = Runtime::new()?;
        runtime.set_memory_limit(MEMORY_LIMIT_BYTES);
        let stop_at = Instant::now() + self.deadline;
        runtime.set_interrupt_handler(Some(Box::new(move || Instant::now() > stop_at)));
        let context = Context::full(&runtime)?;

        // Strip null bytes; QuickJS treats the source as a C string.
        let code = format!("JSON.stringify(({}))", literal.replace('\0', ""));

        context.with(|ctx| {
            let result: Value = ctx.eval(code.as_bytes()).map_err(|e| {
                debug!("State literal failed to evaluate: {}", e);
                anyhow::anyhow!("Failed to evaluate state literal: {}", e)
            })?;
            match result.as_string() {
                Some(s) => Ok(s.to_string()?),
                None => Ok(String::new()),
            }
        })
    }
}

impl Default for StateEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lenient_literal_becomes_json() {
        let value = StateEvaluator::new()
            .to_json("{shareid: 12, list: [{'downloadUrl': 'https://d.terabox.com/file/a',},],}")
            .unwrap();
        assert_eq!(value["shareid"], 12);
        assert_eq!(value["list"][0]["downloadUrl"], "https://d.terabox.com/file/a");
    }

    #[test]
    fn test_runaway_literal_is_interrupted() {
        let err = StateEvaluator::new().to_json("(function(){ while (true) {} })()");
        assert!(err.is_err());
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(StateEvaluator::new().to_json("{ not: valid: js }").is_err());
    }
}
