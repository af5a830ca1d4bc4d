//! Scripted translator for engine, queue and API tests.
//! Output is `[<lang>] <text>`, which keeps placeholders intact.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{TranslateError, TranslateRequest, TranslateResult, Translator};

enum Behaviour {
    /// Fail this many more times, then succeed.
    FailTimes(u32),
    FailAlways,
    /// Answer with placeholders stripped.
    DropPlaceholders,
}

struct Rule {
    needle: String,
    behaviour: Behaviour,
    error: fn() -> TranslateError,
}

#[derive(Default)]
pub struct MockTranslator {
    rules: Mutex<Vec<Rule>>,
    calls: AtomicU32,
    requests: Mutex<Vec<TranslateRequest>>,
}

impl MockTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests whose text contains `needle` fail `times` times with a timeout.
    pub fn fail_times(self, needle: &str, times: u32) -> Self {
        self.fail_times_with(needle, times, || TranslateError::Timeout)
    }

    pub fn fail_times_with(self, needle: &str, times: u32, error: fn() -> TranslateError) -> Self {
        self.rules.lock().push(Rule {
            needle: needle.into(),
            behaviour: Behaviour::FailTimes(times),
            error,
        });
        self
    }

    /// Requests whose text contains `needle` always fail with `error`.
    pub fn fail_always(self, needle: &str, error: fn() -> TranslateError) -> Self {
        self.rules.lock().push(Rule {
            needle: needle.into(),
            behaviour: Behaviour::FailAlways,
            error,
        });
        self
    }

    pub fn drop_placeholders(self, needle: &str) -> Self {
        self.rules.lock().push(Rule {
            needle: needle.into(),
            behaviour: Behaviour::DropPlaceholders,
            error: || TranslateError::Timeout,
        });
        self
    }

    /// Stop failing: clears every rule.
    pub fn heal(&self) {
        self.rules.lock().clear();
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<TranslateRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Translator for MockTranslator {
    fn model(&self) -> &str {
        "mock-model"
    }

    async fn translate(
        &self,
        request: &TranslateRequest,
    ) -> Result<TranslateResult, TranslateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        let mut output = format!("[{}] {}", request.target_lang, request.text);
        {
            let mut rules = self.rules.lock();
            for rule in rules.iter_mut() {
                if !request.text.contains(&rule.needle) {
                    continue;
                }
                match &mut rule.behaviour {
                    Behaviour::FailTimes(0) => {}
                    Behaviour::FailTimes(n) => {
                        *n -= 1;
                        return Err((rule.error)());
                    }
                    Behaviour::FailAlways => return Err((rule.error)()),
                    Behaviour::DropPlaceholders => {
                        output = format!("[{}] mangled", request.target_lang);
                    }
                }
            }
        }

        Ok(TranslateResult {
            translated_text: output,
            tokens_used: 10,
        })
    }
}
