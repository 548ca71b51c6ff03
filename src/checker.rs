//! Checker programs deciding whether a run's output is acceptable.
//!
//! A checker lazily owns one compiled comparator binary inside the sandbox.
//! `DefaultChecker` compiles the packaged comparator and speaks the
//! exit-code protocol (0/1/2); `TestlibChecker` compiles user-supplied
//! source against the packaged `testlib.h` and derives the verdict from the
//! sandbox run status. For interactive problems the testlib binary is run
//! as an interactor by the pipeline instead of as a post-run comparator.

use std::collections::HashMap;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::sandbox::{
    PreparedFile, SandboxClient, SandboxCmd, SandboxError, SandboxFile, SandboxStatus,
};
use crate::verdict::JudgeStatus;

/// Packaged comparator used for traditional problems.
pub const DEFAULT_CHECKER_SOURCE: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/default_checker.cpp"));

/// Packaged testlib header staged next to user-supplied checker sources.
pub const TESTLIB_HEADER: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/testlib.h"));

const SOURCE_FILENAME: &str = "Checker.cpp";
const COMPILED_FILENAME: &str = "Checker";
const COMPILE_CMD: &[&str] = &[
    "/usr/bin/g++-12",
    "Checker.cpp",
    "-o",
    "Checker",
    "-std=c++17",
    "-O2",
    "-lm",
    "-w",
    "-fmax-errors=3",
    "--static",
];

/// Failure while compiling or running a checker.
#[derive(Debug, Error)]
pub enum CheckerError {
    #[error("failed to compile checker: {stderr}")]
    Compile { stderr: String },
    #[error("checker exited with unexpected status {exit_status}")]
    UnexpectedExit { exit_status: i64 },
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

/// A comparator program compiled and run inside the sandbox.
///
/// `check` receives the testcase input, the expected answer and the user
/// output; it performs a single sandbox run and no other I/O.
#[async_trait]
pub trait Checker: Send {
    /// Compile the comparator if not already compiled and return the
    /// compiled binary. Idempotent.
    async fn compile(&mut self, client: &SandboxClient) -> Result<PreparedFile, CheckerError>;

    /// Judge the user output against the expected answer.
    async fn check(
        &mut self,
        client: &SandboxClient,
        input: &SandboxFile,
        answer: &SandboxFile,
        output: &SandboxFile,
    ) -> Result<JudgeStatus, CheckerError>;

    /// Delete the compiled binary if this checker created it. Cached
    /// entries are owned by the file cache, not the checker.
    async fn close(&mut self, client: &SandboxClient);
}

fn compile_cmd(copy_in: HashMap<String, SandboxFile>) -> SandboxCmd {
    SandboxCmd {
        args: COMPILE_CMD.iter().map(|s| s.to_string()).collect(),
        files: vec![
            Some(SandboxFile::memory("")),
            Some(SandboxFile::collector("stdout")),
            Some(SandboxFile::collector("stderr")),
        ],
        copy_in,
        copy_out_cached: vec![COMPILED_FILENAME.to_string()],
        ..SandboxCmd::default()
    }
}

async fn run_compile(
    client: &SandboxClient,
    copy_in: HashMap<String, SandboxFile>,
) -> Result<PreparedFile, CheckerError> {
    let result = client.run_single(compile_cmd(copy_in)).await?;
    if result.status != SandboxStatus::Accepted {
        return Err(CheckerError::Compile {
            stderr: result.files.get("stderr").cloned().unwrap_or_default(),
        });
    }
    match result.file_ids.get(COMPILED_FILENAME) {
        Some(file_id) => Ok(PreparedFile::new(file_id.clone())),
        None => Err(CheckerError::Compile {
            stderr: "compiled checker binary missing from sandbox response".to_string(),
        }),
    }
}

fn sha256_hex(content: &str) -> String {
    Sha256::digest(content.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Comparator for traditional problems, compiled from the packaged source.
///
/// Run as `./Checker tc.in tc.out user.out`; the exit code is the verdict:
/// 0 accepted, 1 wrong answer, 2 presentation error, anything else fatal.
pub struct DefaultChecker {
    code: String,
    compiled_file: Option<PreparedFile>,
}

impl DefaultChecker {
    pub fn new() -> Self {
        Self {
            code: DEFAULT_CHECKER_SOURCE.to_string(),
            compiled_file: None,
        }
    }
}

impl Default for DefaultChecker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Checker for DefaultChecker {
    async fn compile(&mut self, client: &SandboxClient) -> Result<PreparedFile, CheckerError> {
        if let Some(file) = &self.compiled_file {
            return Ok(file.clone());
        }
        debug!("Compiling default checker");
        let copy_in = HashMap::from([(
            SOURCE_FILENAME.to_string(),
            SandboxFile::memory(self.code.clone()),
        )]);
        let file = run_compile(client, copy_in).await?;
        self.compiled_file = Some(file.clone());
        debug!("Default checker compiled as '{}'", file.file_id);
        Ok(file)
    }

    async fn check(
        &mut self,
        client: &SandboxClient,
        input: &SandboxFile,
        answer: &SandboxFile,
        output: &SandboxFile,
    ) -> Result<JudgeStatus, CheckerError> {
        let compiled = self.compile(client).await?;

        let cmd = SandboxCmd {
            args: vec!["./Checker", "tc.in", "tc.out", "user.out"]
                .into_iter()
                .map(String::from)
                .collect(),
            files: vec![
                Some(SandboxFile::memory("")),
                Some(SandboxFile::collector("stdout")),
                Some(SandboxFile::collector("stderr")),
            ],
            copy_in: HashMap::from([
                (COMPILED_FILENAME.to_string(), SandboxFile::from(compiled)),
                ("tc.in".to_string(), input.clone()),
                ("tc.out".to_string(), answer.clone()),
                ("user.out".to_string(), output.clone()),
            ]),
            ..SandboxCmd::default()
        };
        let result = client.run_single(cmd).await?;

        match result.exit_status {
            0 => Ok(JudgeStatus::Accepted),
            1 => Ok(JudgeStatus::WrongAnswer),
            2 => Ok(JudgeStatus::PresentationError),
            exit_status => Err(CheckerError::UnexpectedExit { exit_status }),
        }
    }

    async fn close(&mut self, client: &SandboxClient) {
        if let Some(file) = self.compiled_file.take() {
            let _ = client.spawn_delete(file.file_id).await;
            debug!("Default checker closed");
        }
    }
}

/// Comparator or interactor compiled from user-supplied testlib source.
///
/// The compiled binary and the uploaded header are staged through the file
/// cache, keyed on the SHA-256 of their sources, so repeat submissions for
/// the same problem skip the compile entirely.
pub struct TestlibChecker {
    code: String,
    compiled_file: Option<PreparedFile>,
}

impl TestlibChecker {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            compiled_file: None,
        }
    }

    async fn testlib_header(client: &SandboxClient) -> Result<PreparedFile, CheckerError> {
        let key = format!("testlib.h:{}", sha256_hex(TESTLIB_HEADER));
        if let Some(file) = client.cache().get(&key) {
            return Ok(file);
        }
        debug!("Uploading testlib header");
        let file = client.upload_file(TESTLIB_HEADER.to_string()).await?;
        client.cache().set(&key, file.clone());
        Ok(file)
    }
}

#[async_trait]
impl Checker for TestlibChecker {
    async fn compile(&mut self, client: &SandboxClient) -> Result<PreparedFile, CheckerError> {
        if let Some(file) = &self.compiled_file {
            return Ok(file.clone());
        }

        let key = format!("checker:{}", sha256_hex(&self.code));
        if let Some(file) = client.cache().get(&key) {
            debug!("Using cached checker '{}'", file.file_id);
            self.compiled_file = Some(file.clone());
            return Ok(file);
        }

        debug!("Compiling testlib checker");
        let testlib = Self::testlib_header(client).await?;
        let copy_in = HashMap::from([
            (
                SOURCE_FILENAME.to_string(),
                SandboxFile::memory(self.code.clone()),
            ),
            ("testlib.h".to_string(), SandboxFile::from(testlib)),
        ]);
        let file = run_compile(client, copy_in).await?;
        client.cache().set(&key, file.clone());
        self.compiled_file = Some(file.clone());
        debug!("Testlib checker compiled as '{}'", file.file_id);
        Ok(file)
    }

    async fn check(
        &mut self,
        client: &SandboxClient,
        input: &SandboxFile,
        answer: &SandboxFile,
        output: &SandboxFile,
    ) -> Result<JudgeStatus, CheckerError> {
        let compiled = self.compile(client).await?;

        let cmd = SandboxCmd {
            args: vec!["./Checker", "infile", "outfile", "ansfile"]
                .into_iter()
                .map(String::from)
                .collect(),
            files: vec![
                Some(SandboxFile::memory("")),
                Some(SandboxFile::collector("stdout")),
                Some(SandboxFile::collector("stderr")),
            ],
            copy_in: HashMap::from([
                (COMPILED_FILENAME.to_string(), SandboxFile::from(compiled)),
                ("infile".to_string(), input.clone()),
                ("outfile".to_string(), output.clone()),
                ("ansfile".to_string(), answer.clone()),
            ]),
            ..SandboxCmd::default()
        };
        let result = client.run_single(cmd).await?;

        Ok(match result.status {
            SandboxStatus::Accepted => JudgeStatus::Accepted,
            SandboxStatus::NonzeroExitStatus => JudgeStatus::WrongAnswer,
            _ => JudgeStatus::SystemError,
        })
    }

    async fn close(&mut self, _client: &SandboxClient) {
        // Compiled binaries live in the file cache, which owns them.
        self.compiled_file = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    const DEFAULT_CHECK: &str = r#""args":["./Checker","tc.in""#;
    const TESTLIB_CHECK: &str = r#""args":["./Checker","infile""#;

    struct BodyContains(&'static str);

    impl wiremock::Match for BodyContains {
        fn matches(&self, request: &Request) -> bool {
            std::str::from_utf8(&request.body)
                .map(|body| body.contains(self.0))
                .unwrap_or(false)
        }
    }

    fn compile_ok() -> serde_json::Value {
        serde_json::json!([{
            "status": "Accepted",
            "exitStatus": 0,
            "time": 100000000u64,
            "memory": 10485760u64,
            "files": {"stdout": "", "stderr": ""},
            "fileIds": {"Checker": "checker-bin"}
        }])
    }

    fn checker_run(status: &str, exit_status: i64) -> serde_json::Value {
        serde_json::json!([{
            "status": status,
            "exitStatus": exit_status,
            "time": 1000000u64,
            "memory": 1048576u64,
            "files": {"stdout": "", "stderr": ""}
        }])
    }

    async fn mount_compile(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/run"))
            .and(BodyContains("Checker.cpp"))
            .respond_with(ResponseTemplate::new(200).set_body_json(compile_ok()))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_default_checker_exit_code_protocol() {
        for (exit_status, expected) in [
            (0, JudgeStatus::Accepted),
            (1, JudgeStatus::WrongAnswer),
            (2, JudgeStatus::PresentationError),
        ] {
            let server = MockServer::start().await;
            mount_compile(&server).await;
            let status = if exit_status == 0 {
                "Accepted"
            } else {
                "Nonzero Exit Status"
            };
            Mock::given(method("POST"))
                .and(path("/run"))
                .and(BodyContains(DEFAULT_CHECK))
                .respond_with(
                    ResponseTemplate::new(200).set_body_json(checker_run(status, exit_status)),
                )
                .mount(&server)
                .await;

            let client = SandboxClient::new(&server.uri());
            let mut checker = DefaultChecker::new();
            let verdict = checker
                .check(
                    &client,
                    &SandboxFile::memory("1 1\n"),
                    &SandboxFile::memory("2\n"),
                    &SandboxFile::memory("2\n"),
                )
                .await
                .unwrap();
            assert_eq!(verdict, expected);
        }
    }

    #[tokio::test]
    async fn test_default_checker_unexpected_exit_is_fatal() {
        let server = MockServer::start().await;
        mount_compile(&server).await;
        Mock::given(method("POST"))
            .and(path("/run"))
            .and(BodyContains(DEFAULT_CHECK))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(checker_run("Nonzero Exit Status", 3)),
            )
            .mount(&server)
            .await;

        let client = SandboxClient::new(&server.uri());
        let mut checker = DefaultChecker::new();
        let err = checker
            .check(
                &client,
                &SandboxFile::memory(""),
                &SandboxFile::memory(""),
                &SandboxFile::memory(""),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CheckerError::UnexpectedExit { exit_status: 3 }));
    }

    #[tokio::test]
    async fn test_compile_failure_carries_stderr() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/run"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{
                "status": "Nonzero Exit Status",
                "exitStatus": 1,
                "time": 0,
                "memory": 0,
                "files": {"stdout": "", "stderr": "Checker.cpp:1:1: error: expected declaration"}
            }])))
            .mount(&server)
            .await;

        let client = SandboxClient::new(&server.uri());
        let mut checker = DefaultChecker::new();
        let err = checker.compile(&client).await.unwrap_err();
        match err {
            CheckerError::Compile { stderr } => {
                assert!(stderr.contains("expected declaration"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_compile_is_idempotent() {
        let server = MockServer::start().await;
        mount_compile(&server).await;

        let client = SandboxClient::new(&server.uri());
        let mut checker = DefaultChecker::new();
        let first = checker.compile(&client).await.unwrap();
        let second = checker.compile(&client).await.unwrap();
        assert_eq!(first, second);

        let runs = server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.url.path() == "/run")
            .count();
        assert_eq!(runs, 1);
    }

    #[tokio::test]
    async fn test_default_checker_close_deletes_binary() {
        let server = MockServer::start().await;
        mount_compile(&server).await;
        Mock::given(method("DELETE"))
            .and(path("/file/checker-bin"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = SandboxClient::new(&server.uri());
        let mut checker = DefaultChecker::new();
        checker.compile(&client).await.unwrap();
        checker.close(&client).await;

        let deletes = server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.method.as_str() == "DELETE")
            .count();
        assert_eq!(deletes, 1);
    }

    #[tokio::test]
    async fn test_testlib_checker_status_protocol() {
        for (status, expected) in [
            ("Accepted", JudgeStatus::Accepted),
            ("Nonzero Exit Status", JudgeStatus::WrongAnswer),
            ("Internal Error", JudgeStatus::SystemError),
        ] {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/file"))
                .respond_with(ResponseTemplate::new(200).set_body_json("testlib-file"))
                .mount(&server)
                .await;
            mount_compile(&server).await;
            Mock::given(method("POST"))
                .and(path("/run"))
                .and(BodyContains(TESTLIB_CHECK))
                .respond_with(ResponseTemplate::new(200).set_body_json(checker_run(status, 0)))
                .mount(&server)
                .await;

            let client = SandboxClient::new(&server.uri());
            let mut checker = TestlibChecker::new("#include \"testlib.h\"\nint main(){}");
            let verdict = checker
                .check(
                    &client,
                    &SandboxFile::memory("1 1 2\n"),
                    &SandboxFile::memory("YES\n"),
                    &SandboxFile::memory("YES\n"),
                )
                .await
                .unwrap();
            assert_eq!(verdict, expected);
        }
    }

    #[tokio::test]
    async fn test_testlib_checker_compile_cached_across_instances() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/file"))
            .respond_with(ResponseTemplate::new(200).set_body_json("testlib-file"))
            .mount(&server)
            .await;
        mount_compile(&server).await;

        let client = SandboxClient::new(&server.uri());
        let mut first = TestlibChecker::new("int main(){}");
        first.compile(&client).await.unwrap();
        first.close(&client).await;

        // A fresh checker for the same source hits the cache.
        let mut second = TestlibChecker::new("int main(){}");
        second.compile(&client).await.unwrap();

        let compiles = server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.url.path() == "/run")
            .count();
        assert_eq!(compiles, 1);
    }
}
