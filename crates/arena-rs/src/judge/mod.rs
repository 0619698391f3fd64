//! Submission judging.
//!
//! [`Judge::evaluate`] runs a submission against a problem's hidden test
//! cases, one sandbox call per case, stopping at the first case that is not
//! accepted. It always returns a submission with a terminal verdict:
//! sandbox communication failures become COMPILATION_ERROR with a single
//! synthetic `"error"` test result.

pub mod compare;
pub mod sandbox;

use crate::model::{Problem, Rules, Submission, TestCase, TestResult, Verdict};
use sandbox::{Sandbox, SandboxError, SandboxRequest, SandboxResponse};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use compare::outputs_match;
pub use sandbox::HttpSandbox;

/// Test case id used for the synthetic result of a sandbox failure.
pub const ERROR_TEST_CASE_ID: &str = "error";

const HEALTH_CHECK_SOURCE: &str = r#"#include <iostream>
using namespace std;

int main() {
  int a, b;
  cin >> a >> b;
  cout << a + b << endl;
  return 0;
}
"#;

pub struct Judge {
    sandbox: Arc<dyn Sandbox>,
}

impl Judge {
    pub fn new(sandbox: Arc<dyn Sandbox>) -> Self {
        Self { sandbox }
    }

    /// Judge `submission` against `problem`, returning the judged copy.
    pub async fn evaluate(&self, submission: &Submission, problem: &Problem, rules: &Rules) -> Submission {
        info!(
            submission = %submission.id,
            problem = %problem.id,
            language = %submission.language,
            "Evaluating submission against {} test case(s)",
            problem.test_cases.len()
        );

        let mut judged = submission.clone();
        judged.test_results.clear();
        judged.first_to_solve_bonus = 0;

        match self.run_cases(submission, problem).await {
            Ok(results) => {
                judged.status = results
                    .iter()
                    .map(|r| r.verdict)
                    .find(|v| !v.is_accepted())
                    .unwrap_or(Verdict::Accepted);
                judged.score = proportional_score(
                    results.iter().filter(|r| r.verdict.is_accepted()).count(),
                    problem.test_cases.len(),
                    rules.max_score(problem.level),
                );
                judged.test_results = results;
            }
            Err(e) => {
                warn!(submission = %submission.id, "Sandbox failure, judging as CE: {e}");
                judged.status = Verdict::CompilationError;
                judged.score = 0;
                judged.test_results = vec![
                    TestResult::new(ERROR_TEST_CASE_ID, Verdict::CompilationError)
                        .with_error(e.to_string()),
                ];
            }
        }
        judged.penalty = rules.penalty_for(judged.status);

        info!(
            submission = %judged.id,
            status = %judged.status,
            score = judged.score,
            penalty = judged.penalty,
            "Submission judged"
        );
        judged
    }

    async fn run_cases(
        &self,
        submission: &Submission,
        problem: &Problem,
    ) -> Result<Vec<TestResult>, SandboxError> {
        let mut results = Vec::with_capacity(problem.test_cases.len());
        for case in &problem.test_cases {
            let request = SandboxRequest::new(
                &submission.code,
                &submission.language,
                &case.input,
                problem.time_limit_ms,
            );
            let response = self.sandbox.run(&request).await?;
            let result = classify(case, &response, problem.memory_limit_kb());
            debug!(case = %case.id, verdict = %result.verdict, "Test case finished");

            let stop = !result.verdict.is_accepted();
            results.push(result);
            if stop {
                break;
            }
        }
        Ok(results)
    }

    /// Run the a+b probe and report whether the sandbox prints `12`.
    pub async fn health_check(&self) -> bool {
        let request = SandboxRequest::new(HEALTH_CHECK_SOURCE, "cpp", "5 7", 5000);
        match self.sandbox.run(&request).await {
            Ok(resp) => resp
                .execute
                .as_ref()
                .is_some_and(|e| e.stdout().trim() == "12"),
            Err(e) => {
                warn!("Sandbox health check failed: {e}");
                false
            }
        }
    }
}

/// Turn one sandbox response into a test result.
pub fn classify(case: &TestCase, response: &SandboxResponse, memory_limit_kb: u64) -> TestResult {
    if response.compile_failed() {
        let stderr = response.compile_stderr();
        let message = if stderr.is_empty() { "Compilation failed" } else { stderr };
        return TestResult::new(&case.id, Verdict::CompilationError).with_error(message);
    }

    let exec = response.execute.clone().unwrap_or_default();
    let mut result = TestResult::new(&case.id, Verdict::Pending);
    result.execution_time_ms = exec.wall_time_ms();
    result.memory_used_kb = exec.memory_kb();
    result.output = Some(exec.stdout().to_string());

    if exec.exit_code.is_some_and(|code| code != 0) {
        let verdict_text = exec.verdict.as_deref().unwrap_or_default().to_lowercase();
        let stderr = exec.stderr().to_lowercase();
        result.verdict = if verdict_text == "time limit exceeded" || stderr.contains("time limit") {
            Verdict::TimeLimitExceeded
        } else if verdict_text == "memory limit exceeded" || stderr.contains("memory limit") {
            Verdict::MemoryLimitExceeded
        } else {
            Verdict::RuntimeError
        };
        result.error_message = Some(exec.stderr().to_string());
        return result;
    }

    if result.memory_used_kb.is_some_and(|kb| kb > memory_limit_kb) {
        result.verdict = Verdict::MemoryLimitExceeded;
        return result;
    }

    result.verdict = if outputs_match(exec.stdout(), &case.expected_output) {
        Verdict::Accepted
    } else {
        Verdict::WrongAnswer
    };
    result
}

/// `floor(passed / total * max_score)`, 0 for a problem without test cases.
pub fn proportional_score(passed: usize, total: usize, max_score: u32) -> u32 {
    if total == 0 {
        return 0;
    }
    (passed as u64 * max_score as u64 / total as u64) as u32
}

#[cfg(test)]
pub(crate) mod testing {
    use super::sandbox::{
        CompileOutcome, ExecuteOutcome, Measure, Sandbox, SandboxError, SandboxFuture,
        SandboxRequest, SandboxResponse,
    };
    use std::collections::VecDeque;
    use std::sync::Mutex;

    pub fn ok_output(stdout: &str) -> SandboxResponse {
        SandboxResponse {
            compile: Some(CompileOutcome {
                exit_code: Some(0),
                ..Default::default()
            }),
            execute: Some(ExecuteOutcome {
                exit_code: Some(0),
                stdout: Some(stdout.to_string()),
                wall_time: Some(Measure::Text("0.010".into())),
                memory_usage: Some(Measure::Number(1024.0)),
                ..Default::default()
            }),
        }
    }

    /// Answers each request from a script, recording requests.
    #[derive(Default)]
    pub struct ScriptedSandbox {
        script: Mutex<VecDeque<Result<SandboxResponse, SandboxError>>>,
        pub requests: Mutex<Vec<SandboxRequest>>,
    }

    impl ScriptedSandbox {
        pub fn new(script: Vec<Result<SandboxResponse, SandboxError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    impl Sandbox for ScriptedSandbox {
        fn run(&self, request: &SandboxRequest) -> SandboxFuture<'_> {
            self.requests.lock().unwrap().push(request.clone());
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(SandboxError::Request("script exhausted".into())));
            Box::pin(async move { next })
        }
    }

    /// Echoes the expected answer for `a b` stdin: prints `a + b`.
    pub struct AdderSandbox;

    impl Sandbox for AdderSandbox {
        fn run(&self, request: &SandboxRequest) -> SandboxFuture<'_> {
            let sum: i64 = request
                .execute
                .stdin
                .split_whitespace()
                .filter_map(|t| t.parse::<i64>().ok())
                .sum();
            let resp = ok_output(&format!("{sum}\n"));
            Box::pin(async move { Ok(resp) })
        }
    }
}
