//! Judging pipeline for one submission.
//!
//! A `Judger` drives a single submission through compile, checker
//! preparation, sequential testcase execution and verdict aggregation,
//! then releases every sandbox-side file it created. The terminal verdict
//! is never left Pending or RunningJudge.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::checker::Checker;
use crate::languages::{self, Language, LanguageConfig};
use crate::sandbox::{
    PipeIndex, PipeMap, PreparedFile, SandboxClient, SandboxCmd, SandboxError, SandboxFile,
    SandboxStatus,
};
use crate::verdict::JudgeStatus;

/// Problem kind, selecting the judging strategy.
///
/// The integer codes are the wire representation on the task queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ProblemType {
    #[default]
    Traditional = 0,
    SpecialJudge = 1,
    Interaction = 2,
}

impl From<ProblemType> for u8 {
    fn from(problem_type: ProblemType) -> u8 {
        problem_type as u8
    }
}

impl TryFrom<u8> for ProblemType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ProblemType::Traditional),
            1 => Ok(ProblemType::SpecialJudge),
            2 => Ok(ProblemType::Interaction),
            other => Err(format!("invalid problem type code: {}", other)),
        }
    }
}

/// One testcase: input and expected answer, echoed back by uuid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Testcase {
    pub uuid: String,
    pub input: SandboxFile,
    pub output: SandboxFile,
}

/// Submission received from the task queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub sid: i64,
    /// ms
    pub time_limit: u64,
    /// KiB
    pub memory_limit: u64,
    pub testcases: Vec<Testcase>,
    pub language: Language,
    pub code: String,
    #[serde(rename = "type", default)]
    pub problem_type: ProblemType,
    /// Checker or interactor source for non-traditional problems.
    #[serde(default)]
    pub addition_code: String,
}

/// Per-testcase verdict published on the result queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestcaseResult {
    pub uuid: String,
    /// ms
    #[serde(default)]
    pub time: u64,
    /// KiB
    #[serde(default)]
    pub memory: u64,
    pub judge: JudgeStatus,
}

impl TestcaseResult {
    fn new(uuid: impl Into<String>, judge: JudgeStatus) -> Self {
        Self {
            uuid: uuid.into(),
            time: 0,
            memory: 0,
            judge,
        }
    }
}

/// Overall verdict published on the result queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionResult {
    pub sid: i64,
    /// ms
    #[serde(default)]
    pub time: u64,
    /// KiB
    #[serde(default)]
    pub memory: u64,
    #[serde(default)]
    pub testcases: Vec<TestcaseResult>,
    pub judge: JudgeStatus,
    #[serde(default)]
    pub error: String,
}

impl SubmissionResult {
    fn pending(sid: i64) -> Self {
        Self {
            sid,
            time: 0,
            memory: 0,
            testcases: Vec::new(),
            judge: JudgeStatus::Pending,
            error: String::new(),
        }
    }

    /// Progress event published before judging starts.
    pub fn running(sid: i64) -> Self {
        Self {
            judge: JudgeStatus::RunningJudge,
            ..Self::pending(sid)
        }
    }

    /// Fallback result when the pipeline cannot even start.
    pub fn system_error(sid: i64, error: impl Into<String>) -> Self {
        Self {
            judge: JudgeStatus::SystemError,
            error: error.into(),
            ..Self::pending(sid)
        }
    }
}

/// Per-submission state machine.
///
/// The stored result doubles as the pipeline state: early exits write the
/// terminal verdict into it and return, which makes `get_result`
/// idempotence a check on the stored status.
pub struct Judger<'a> {
    client: &'a SandboxClient,
    submission: Submission,
    checker: &'a mut dyn Checker,
    language: Option<LanguageConfig>,
    result: SubmissionResult,
    compiled_file: Option<PreparedFile>,
    cleanup_tasks: Vec<JoinHandle<()>>,
}

impl<'a> Judger<'a> {
    /// The checker is chosen by the caller from the submission type and
    /// stays owned by the caller; the pipeline never closes it.
    pub fn new(
        client: &'a SandboxClient,
        submission: Submission,
        checker: &'a mut dyn Checker,
    ) -> Self {
        let mut result = SubmissionResult::pending(submission.sid);

        let language = match languages::get_language_config(submission.language) {
            Ok(config) => Some(config),
            Err(e) => {
                result.judge = JudgeStatus::SystemError;
                error!(
                    "Submission {} failed on initialization: {}",
                    submission.sid, e
                );
                None
            }
        };

        debug!("Submission {} initialized", submission.sid);
        Self {
            client,
            submission,
            checker,
            language,
            result,
            compiled_file: None,
            cleanup_tasks: Vec::new(),
        }
    }

    /// Run the pipeline if it has not run yet and return the stored
    /// result. A second call performs no sandbox traffic.
    pub async fn get_result(&mut self) -> SubmissionResult {
        if self.result.judge == JudgeStatus::Pending {
            if let Err(e) = self.run().await {
                self.result.judge = JudgeStatus::SystemError;
                error!(
                    "Submission {} failed on judging: {}",
                    self.submission.sid, e
                );
            }
            self.cleanup().await;
        }
        debug!(
            "Submission {} result: {}",
            self.submission.sid, self.result.judge
        );
        self.result.clone()
    }

    async fn run(&mut self) -> anyhow::Result<()> {
        if self.result.judge != JudgeStatus::Pending {
            warn!(
                "Submission {} result already set: {}",
                self.submission.sid, self.result.judge
            );
            return Ok(());
        }
        debug!("Submission {} start judging", self.submission.sid);

        let language = match &self.language {
            Some(language) => language.clone(),
            None => {
                self.result.judge = JudgeStatus::SystemError;
                return Ok(());
            }
        };

        if language.need_compile {
            match self.compile(&language).await {
                Ok(()) => {}
                Err(e) => {
                    self.result.judge = JudgeStatus::SystemError;
                    error!(
                        "Submission {} failed on compilation: {}",
                        self.submission.sid, e
                    );
                    return Ok(());
                }
            }
            if self.result.judge != JudgeStatus::Pending {
                return Ok(());
            }
            if self.compiled_file.is_none() {
                self.result.judge = JudgeStatus::SystemError;
                error!(
                    "Submission {} failed on compilation: no compiled file",
                    self.submission.sid
                );
                return Ok(());
            }
        }

        if self.submission.testcases.is_empty() {
            self.result.judge = JudgeStatus::SystemError;
            self.result.error = "No testcases provided".to_string();
            error!(
                "Submission {} failed on judging: no testcases",
                self.submission.sid
            );
            return Ok(());
        }

        if let Err(e) = self.checker.compile(self.client).await {
            self.result.judge = JudgeStatus::SystemError;
            error!(
                "Submission {} failed on checker compilation: {}",
                self.submission.sid, e
            );
            return Ok(());
        }

        let testcases = std::mem::take(&mut self.submission.testcases);
        let mut skipped = false;
        for testcase in &testcases {
            let testcase_result = if skipped {
                TestcaseResult::new(testcase.uuid.clone(), JudgeStatus::Skipped)
            } else {
                match self.run_testcase(&language, testcase).await {
                    Ok(result) => result,
                    Err(e) => {
                        error!(
                            "Submission {} failed on testing '{}': {}",
                            self.submission.sid, testcase.uuid, e
                        );
                        TestcaseResult::new(testcase.uuid.clone(), JudgeStatus::SystemError)
                    }
                }
            };

            if testcase_result.judge.skips_remaining() {
                skipped = true;
            }
            self.result.testcases.push(testcase_result);
        }
        self.submission.testcases = testcases;

        if self.result.testcases.is_empty() {
            self.result.judge = JudgeStatus::SystemError;
            error!(
                "Submission {} failed on judging: no testcase results",
                self.submission.sid
            );
            return Ok(());
        }

        self.result.time = self
            .result
            .testcases
            .iter()
            .map(|t| t.time)
            .max()
            .unwrap_or(0);
        self.result.memory = self
            .result
            .testcases
            .iter()
            .map(|t| t.memory)
            .max()
            .unwrap_or(0);

        if self
            .result
            .testcases
            .iter()
            .all(|t| t.judge == JudgeStatus::Accepted)
        {
            self.result.judge = JudgeStatus::Accepted;
        } else {
            match JudgeStatus::PRIORITY
                .iter()
                .find(|status| self.result.testcases.iter().any(|t| t.judge == **status))
            {
                Some(status) => self.result.judge = *status,
                None => {
                    self.result.judge = JudgeStatus::SystemError;
                    error!(
                        "Submission {} failed on final check: no status found",
                        self.submission.sid
                    );
                }
            }
        }

        Ok(())
    }

    async fn compile(&mut self, language: &LanguageConfig) -> Result<(), SandboxError> {
        if self.compiled_file.is_some() {
            warn!("Submission {} already compiled", self.submission.sid);
            return Ok(());
        }
        debug!("Submission {} compiling", self.submission.sid);

        let cmd = SandboxCmd {
            args: language.compile_cmd.clone(),
            files: vec![
                Some(SandboxFile::memory("")),
                Some(SandboxFile::collector("stdout")),
                Some(SandboxFile::collector("stderr")),
            ],
            copy_in: HashMap::from([(
                language.source_filename.clone(),
                SandboxFile::memory(self.submission.code.clone()),
            )]),
            copy_out_cached: vec![language.compiled_filename.clone()],
            ..SandboxCmd::default()
        };
        let compiled = self.client.run_single(cmd).await?;

        if compiled.status != SandboxStatus::Accepted {
            self.result.judge = JudgeStatus::CompileError;
            self.result.error = compiled.files.get("stderr").cloned().unwrap_or_default();
            debug!(
                "Submission {} ended with compile error: {}",
                self.submission.sid, self.result.error
            );
            return Ok(());
        }

        match compiled.file_ids.get(&language.compiled_filename) {
            Some(file_id) => {
                self.compiled_file = Some(PreparedFile::new(file_id.clone()));
                debug!("Submission {} compiled", self.submission.sid);
                Ok(())
            }
            None => Err(SandboxError::Protocol(format!(
                "compiled artifact '{}' missing from sandbox response",
                language.compiled_filename
            ))),
        }
    }

    /// Files the user program needs at run time: the compiled artifact for
    /// compiled languages, the raw source otherwise.
    fn runtime_dependencies(
        &self,
        language: &LanguageConfig,
    ) -> Result<HashMap<String, SandboxFile>, SandboxError> {
        if language.need_compile {
            match &self.compiled_file {
                Some(file) => Ok(HashMap::from([(
                    language.compiled_filename.clone(),
                    SandboxFile::from(file.clone()),
                )])),
                None => Err(SandboxError::Protocol(
                    "no compiled artifact available for a compiled language".to_string(),
                )),
            }
        } else {
            Ok(HashMap::from([(
                language.source_filename.clone(),
                SandboxFile::memory(self.submission.code.clone()),
            )]))
        }
    }

    async fn run_testcase(
        &mut self,
        language: &LanguageConfig,
        testcase: &Testcase,
    ) -> anyhow::Result<TestcaseResult> {
        debug!("Running testcase '{}'", testcase.uuid);
        let result = match self.submission.problem_type {
            ProblemType::Interaction => self.run_testcase_interaction(language, testcase).await?,
            _ => self.run_testcase_traditional(language, testcase).await?,
        };
        debug!(
            "Testcase '{}' finished with judge status: {}",
            testcase.uuid, result.judge
        );
        Ok(result)
    }

    async fn run_testcase_traditional(
        &mut self,
        language: &LanguageConfig,
        testcase: &Testcase,
    ) -> anyhow::Result<TestcaseResult> {
        let cpu_limit = language.cpu_limit_ns(self.submission.time_limit);
        let memory_limit = language.memory_limit_bytes(self.submission.memory_limit);

        let cmd = SandboxCmd {
            args: language.run_cmd.clone(),
            cpu_limit,
            clock_limit: cpu_limit * 2,
            memory_limit,
            files: vec![
                Some(testcase.input.clone()),
                Some(SandboxFile::collector("stdout")),
                Some(SandboxFile::collector("stderr")),
            ],
            copy_in: self.runtime_dependencies(language)?,
            copy_out_cached: vec!["stdout".to_string()],
            ..SandboxCmd::default()
        };
        let run_result = self.client.run_single(cmd).await?;

        let time = run_result.time.min(cpu_limit) / 1_000_000;
        let memory = run_result.memory.min(memory_limit) / 1024;

        let output_file = match run_result.file_ids.get("stdout") {
            Some(file_id) => PreparedFile::new(file_id.clone()),
            None => {
                return Err(SandboxError::Protocol(
                    "stdout capture missing from sandbox response".to_string(),
                )
                .into())
            }
        };

        let checked = if run_result.status == SandboxStatus::Accepted {
            self.checker
                .check(
                    self.client,
                    &testcase.input,
                    &testcase.output,
                    &SandboxFile::from(output_file.clone()),
                )
                .await
                .map_err(anyhow::Error::from)
        } else {
            Ok(JudgeStatus::from_run_status(run_result.status))
        };
        // The capture is scheduled for deletion whether or not the checker
        // succeeded; cleanup joins the task before the pipeline returns.
        self.cleanup_tasks
            .push(self.client.spawn_delete(output_file.file_id));
        let judge = checked?;

        Ok(TestcaseResult {
            uuid: testcase.uuid.clone(),
            time,
            memory,
            judge,
        })
    }

    async fn run_testcase_interaction(
        &mut self,
        language: &LanguageConfig,
        testcase: &Testcase,
    ) -> anyhow::Result<TestcaseResult> {
        let cpu_limit = language.cpu_limit_ns(self.submission.time_limit);
        let memory_limit = language.memory_limit_bytes(self.submission.memory_limit);

        let interactor = self.checker.compile(self.client).await?;

        let cmd_user = SandboxCmd {
            args: language.run_cmd.clone(),
            cpu_limit,
            clock_limit: cpu_limit * 2,
            memory_limit,
            files: vec![None, None, Some(SandboxFile::collector("stderr"))],
            copy_in: self.runtime_dependencies(language)?,
            ..SandboxCmd::default()
        };
        let cmd_interactor = SandboxCmd {
            args: vec!["./Interactor", "infile", "outfile", "ansfile"]
                .into_iter()
                .map(String::from)
                .collect(),
            files: vec![None, None, Some(SandboxFile::collector("stderr"))],
            copy_in: HashMap::from([
                ("Interactor".to_string(), SandboxFile::from(interactor)),
                ("infile".to_string(), testcase.input.clone()),
                ("outfile".to_string(), SandboxFile::memory("")),
                ("ansfile".to_string(), testcase.output.clone()),
            ]),
            ..SandboxCmd::default()
        };
        let pipe_mapping = vec![
            PipeMap {
                input: PipeIndex { index: 0, fd: 1 },
                out: PipeIndex { index: 1, fd: 0 },
            },
            PipeMap {
                input: PipeIndex { index: 1, fd: 1 },
                out: PipeIndex { index: 0, fd: 0 },
            },
        ];

        let mut results = self
            .client
            .run_command(vec![cmd_user, cmd_interactor], pipe_mapping)
            .await?;
        if results.len() != 2 {
            return Err(SandboxError::Protocol(format!(
                "expected two results for an interactive run, got {}",
                results.len()
            ))
            .into());
        }
        let interactor_result = results.pop().ok_or_else(|| {
            SandboxError::Protocol("missing interactor result".to_string())
        })?;
        let user_result = results
            .pop()
            .ok_or_else(|| SandboxError::Protocol("missing user result".to_string()))?;

        let time = user_result.time.min(cpu_limit) / 1_000_000;
        let memory = user_result.memory.min(memory_limit) / 1024;

        let judge = if user_result.status != SandboxStatus::Accepted {
            JudgeStatus::from_run_status(user_result.status)
        } else if interactor_result.status != SandboxStatus::Accepted {
            JudgeStatus::WrongAnswer
        } else {
            JudgeStatus::Accepted
        };

        Ok(TestcaseResult {
            uuid: testcase.uuid.clone(),
            time,
            memory,
            judge,
        })
    }

    /// Always runs after the pipeline, success or failure: deletes the
    /// compiled user artifact and joins every scheduled delete.
    async fn cleanup(&mut self) {
        debug!("Submission {} cleanup started", self.submission.sid);

        if let Some(file) = self.compiled_file.take() {
            self.cleanup_tasks
                .push(self.client.spawn_delete(file.file_id));
        }
        for task in self.cleanup_tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(
                    "Submission {} cleanup task failed: {}",
                    self.submission.sid, e
                );
            }
        }

        debug!("Submission {} cleanup completed", self.submission.sid);
    }
}
