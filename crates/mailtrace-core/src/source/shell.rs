use std::fmt::Write as _;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{FixedOffset, NaiveDateTime};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::LogSource;
use crate::error::TraceError;
use crate::model::{LogEntry, LogQuery, TimeWindow};
use crate::parser::LineParser;
use crate::settings::{HostSettings, SshSettings, parse_utc_offset};

const SSH_FAILURE: i32 = 255;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String
}

/// Runs one shell command on a remote host.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn exec(
        &self,
        command: &str,
        stdin: Option<&str>
    ) -> Result<CommandOutput, TraceError>;
}

/// [`RemoteShell`] over the system OpenSSH client.
///
/// Key logins pass `-i`; password logins go through `sshpass -e` so the
/// password never shows up in the process list.
#[derive(Debug, Clone)]
pub struct OpenSshTransport {
    host: String,
    username: String,
    port: u16,
    private_key: Option<PathBuf>,
    password: Option<String>,
    connect_timeout: Duration
}

impl OpenSshTransport {
    pub fn new(
        host: &str,
        ssh: &SshSettings
    ) -> Self {
        Self {
            host: host.to_string(),
            username: ssh.username.clone(),
            port: ssh.port,
            private_key: ssh.private_key.clone(),
            password: ssh.password.clone(),
            connect_timeout: ssh.connect_timeout
        }
    }

    fn command(
        &self,
        remote: &str
    ) -> Command {
        let mut cmd = match self.password.as_deref() {
            Some(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").arg("ssh").env("SSHPASS", password);
                cmd
            }
            None => {
                let mut cmd = Command::new("ssh");
                cmd.arg("-o").arg("BatchMode=yes");
                cmd
            }
        };

        cmd.arg("-p")
            .arg(self.port.to_string())
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.connect_timeout.as_secs().max(1)
            ))
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new");
        if let Some(key) = &self.private_key {
            cmd.arg("-i").arg(key);
        }
        cmd.arg(format!("{}@{}", self.username, self.host))
            .arg("--")
            .arg(remote)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl RemoteShell for OpenSshTransport {
    async fn exec(
        &self,
        command: &str,
        stdin: Option<&str>
    ) -> Result<CommandOutput, TraceError> {
        let mut child = self.command(command).spawn().map_err(|err| {
            TraceError::network(
                format!("failed to start ssh for {}: {err}", self.host),
                "install the OpenSSH client (and sshpass for password logins)",
            )
        })?;

        if let Some(mut pipe) = child.stdin.take() {
            if let Some(input) = stdin {
                pipe.write_all(input.as_bytes()).await.map_err(|err| {
                    TraceError::query(
                        format!("failed to write to ssh stdin on {}: {err}", self.host),
                        "check that the remote command accepts input",
                    )
                })?;
            }
            drop(pipe);
        }

        let output = child.wait_with_output().await.map_err(|err| {
            TraceError::network(
                format!("ssh to {} failed: {err}", self.host),
                "check network connectivity to the host",
            )
        })?;

        let result = CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if result.status == SSH_FAILURE {
            return Err(classify_ssh_failure(&self.host, &self.username, &result.stderr));
        }
        Ok(result)
    }
}

fn classify_ssh_failure(
    host: &str,
    username: &str,
    stderr: &str
) -> TraceError {
    let lower = stderr.to_ascii_lowercase();
    let detail = stderr.trim();
    if lower.contains("permission denied") || lower.contains("authentication") {
        TraceError::auth(
            format!("authentication failed for {username}@{host}: {detail}"),
            "check ssh.username and the configured password or private key",
        )
    } else {
        TraceError::network(
            format!("cannot reach {host}: {detail}"),
            "check the host name, ssh.port and network connectivity",
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Privilege {
    User,
    Sudo { password: Option<String> }
}

/// Reads a host's maillog files over a [`RemoteShell`].
#[derive(Clone)]
pub struct ShellSource {
    host: String,
    shell: Arc<dyn RemoteShell>,
    files: Vec<String>,
    time_format: String,
    offset: FixedOffset,
    parser: LineParser,
    privilege: Privilege
}

impl ShellSource {
    /// Opens an ssh session to `host` and checks that it accepts commands.
    pub async fn connect(
        host: &str,
        ssh: &SshSettings
    ) -> Result<Self, TraceError> {
        let transport = OpenSshTransport::new(host, ssh);
        transport.exec("true", None).await?;

        let sudo = if ssh.sudo { Some(ssh.sudo_pass.clone()) } else { None };
        Self::with_shell(host, ssh.host(host), sudo, Arc::new(transport))
    }

    /// `sudo` is `Some(password)` to run file reads through `sudo -S`.
    pub fn with_shell(
        host: &str,
        settings: HostSettings,
        sudo: Option<Option<String>>,
        shell: Arc<dyn RemoteShell>
    ) -> Result<Self, TraceError> {
        let offset = parse_utc_offset(&settings.time_zone)?;
        let time_format = settings.window_time_format().to_string();
        let privilege = match sudo {
            Some(password) => Privilege::Sudo { password },
            None => Privilege::User
        };

        Ok(Self {
            host: host.to_string(),
            shell,
            files: settings.log_files,
            time_format,
            offset,
            parser: LineParser::new(settings.log_parser, offset),
            privilege
        })
    }

    pub fn with_parser(
        mut self,
        parser: LineParser
    ) -> Self {
        self.parser = parser;
        self
    }

    async fn run(
        &self,
        command: &str
    ) -> Result<CommandOutput, TraceError> {
        match &self.privilege {
            Privilege::User => self.shell.exec(command, None).await,
            Privilege::Sudo { password: Some(password) } => {
                let command = format!("sudo -S -p '' {command}");
                let stdin = format!("{password}\n");
                self.shell.exec(&command, Some(&stdin)).await
            }
            Privilege::Sudo { password: None } => {
                self.shell.exec(&format!("sudo -n {command}"), None).await
            }
        }
    }

    async fn file_exists(
        &self,
        path: &str
    ) -> Result<bool, TraceError> {
        let output = self.run(&format!("stat -- {}", shell_quote(path))).await?;
        if output.status == 0 {
            return Ok(true);
        }
        let stderr = output.stderr.to_ascii_lowercase();
        if stderr.contains("permission denied") {
            return Err(self.permission_denied(path, &output.stderr));
        }
        if !stderr.contains("no such file") {
            debug!(
                "stat failed: host={}, file={path}, status={}, stderr={}",
                self.host,
                output.status,
                output.stderr.trim()
            );
        }
        Ok(false)
    }

    fn permission_denied(
        &self,
        path: &str,
        stderr: &str
    ) -> TraceError {
        TraceError::query(
            format!(
                "permission denied reading {path} on {}: {}",
                self.host,
                stderr.trim()
            ),
            "enable ssh.sudo or grant the ssh user read access to the log files",
        )
    }

    /// Pipeline that prints the matching lines of `path`.
    fn read_command(
        &self,
        path: &str,
        query: &LogQuery
    ) -> Result<String, TraceError> {
        let mut command = match query.window {
            Some(window) => self.window_filter(path, window)?,
            None => format!("cat -- {}", shell_quote(path))
        };

        for keyword in query.keywords.iter().filter(|kw| !kw.is_empty()) {
            command.push_str(&format!(" | grep -iF -e {}", shell_quote(keyword)));
        }

        let ids = query.requested_ids();
        if !ids.is_empty() {
            command.push_str(" | grep -F");
            for id in ids {
                command.push_str(&format!(" -e {}", shell_quote(id)));
            }
        }
        if let Some(message_id) = query.message_id.as_deref() {
            command.push_str(&format!(" | grep -F -e {}", shell_quote(message_id)));
        }

        Ok(command)
    }

    /// `awk` stage comparing the fixed-width timestamp prefix of each line
    /// lexically against the window bounds.
    fn window_filter(
        &self,
        path: &str,
        window: TimeWindow
    ) -> Result<String, TraceError> {
        let (start, end) = window.local_bounds(self.offset);
        let start = self.format_bound(start)?;
        let end = self.format_bound(end)?;
        let width = start.chars().count().max(end.chars().count());
        let upper = if window.end_inclusive() { "<=" } else { "<" };

        let program = format!(
            "{{ ts = substr($0, 1, {width}); if (ts >= start && ts {upper} end) print }}"
        );
        Ok(format!(
            "awk -v start={} -v end={} {} {}",
            shell_quote(&start),
            shell_quote(&end),
            shell_quote(&program),
            shell_quote(path)
        ))
    }

    fn format_bound(
        &self,
        instant: NaiveDateTime
    ) -> Result<String, TraceError> {
        let mut out = String::new();
        write!(out, "{}", instant.format(&self.time_format)).map_err(|_| {
            TraceError::config(
                format!("invalid time_format for {}: {}", self.host, self.time_format),
                "use a fixed-width strftime layout such as %Y-%m-%d %H:%M:%S",
            )
        })?;
        Ok(out)
    }

    async fn read_file(
        &self,
        path: &str,
        query: &LogQuery
    ) -> Result<Option<String>, TraceError> {
        let command = self.read_command(path, query)?;
        debug!("remote read: host={}, command={command}", self.host);

        let output = self.run(&command).await?;
        let stderr = output.stderr.to_ascii_lowercase();
        if stderr.contains("permission denied") {
            return Err(self.permission_denied(path, &output.stderr));
        }
        if stderr.contains("no such file") {
            warn!("log file vanished while reading: host={}, file={path}", self.host);
            return Ok(None);
        }
        if !output.stderr.trim().is_empty() {
            debug!(
                "remote stderr: host={}, file={path}, stderr={}",
                self.host,
                output.stderr.trim()
            );
        }
        Ok(Some(output.stdout))
    }

    fn parse_lines(
        &self,
        raw: &str
    ) -> Result<Vec<LogEntry>, TraceError> {
        let mut entries = Vec::new();
        let mut failed = 0usize;
        let mut last_error = None;

        for line in raw.lines().filter(|line| !line.trim().is_empty()) {
            match self.parser.parse(line) {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    warn!("skipping unparsable line: host={}, error={err}", self.host);
                    failed += 1;
                    last_error = Some(err);
                }
            }
        }

        if entries.is_empty()
            && let Some(err) = last_error
        {
            return Err(TraceError::parse(
                format!(
                    "none of {failed} lines from {} could be parsed: {}",
                    self.host,
                    err.message()
                ),
                format!(
                    "check ssh.hosts.{}.log_parser (currently {:?})",
                    self.host,
                    self.parser.format()
                ),
            ));
        }
        Ok(entries)
    }
}

#[async_trait]
impl LogSource for ShellSource {
    fn host(&self) -> Option<&str> {
        Some(&self.host)
    }

    async fn query(
        &self,
        query: &LogQuery
    ) -> Result<Vec<LogEntry>, TraceError> {
        let mut existing = Vec::with_capacity(self.files.len());
        for path in &self.files {
            if self.file_exists(path).await? {
                existing.push(path.as_str());
            } else {
                warn!("log file not found: host={}, file={path}", self.host);
            }
        }
        if existing.is_empty() {
            warn!(
                "none of the configured log files exist: host={}, files={}",
                self.host,
                self.files.join(",")
            );
            return Ok(Vec::new());
        }

        let mut raw = String::new();
        for path in existing {
            if let Some(output) = self.read_file(path, query).await? {
                raw.push_str(&output);
                if !raw.ends_with('\n') {
                    raw.push('\n');
                }
            }
        }

        let mut entries = self.parse_lines(&raw)?;
        let ids = query.requested_ids();
        if !ids.is_empty() {
            entries.retain(|entry| {
                entry.mail_id.as_deref().is_some_and(|id| ids.contains(&id))
            });
        }

        info!("remote query done: host={}, entries={}", self.host, entries.len());
        Ok(entries)
    }
}

/// Single-quotes `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::{DateTime, TimeDelta, Utc};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::parser::LineFormat;

    #[derive(Default)]
    struct FakeShell {
        missing: Vec<String>,
        denied: bool,
        stdout: String,
        calls: Mutex<Vec<(String, Option<String>)>>
    }

    impl FakeShell {
        fn calls(&self) -> Vec<(String, Option<String>)> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    #[async_trait]
    impl RemoteShell for FakeShell {
        async fn exec(
            &self,
            command: &str,
            stdin: Option<&str>
        ) -> Result<CommandOutput, TraceError> {
            self.calls
                .lock()
                .expect("calls lock")
                .push((command.to_string(), stdin.map(str::to_string)));

            if command.contains("stat -- ") {
                let missing = self.missing.iter().any(|path| command.contains(path.as_str()));
                return Ok(if missing {
                    CommandOutput {
                        status: 1,
                        stderr: "stat: cannot statx: No such file or directory".to_string(),
                        ..CommandOutput::default()
                    }
                } else {
                    CommandOutput::default()
                });
            }
            if self.denied {
                return Ok(CommandOutput {
                    status: 2,
                    stderr: "cat: /var/log/mail.log: Permission denied".to_string(),
                    ..CommandOutput::default()
                });
            }
            Ok(CommandOutput { stdout: self.stdout.clone(), ..CommandOutput::default() })
        }
    }

    fn host_settings(files: &[&str]) -> HostSettings {
        HostSettings {
            log_files: files.iter().map(|file| file.to_string()).collect(),
            ..HostSettings::default()
        }
    }

    fn source(
        shell: Arc<FakeShell>,
        files: &[&str],
        sudo: Option<Option<String>>
    ) -> ShellSource {
        ShellSource::with_shell("mx1", host_settings(files), sudo, shell)
            .expect("source should build")
    }

    const LINES: &str = "\
2025-02-01T10:00:00Z mx1 postfix/cleanup[1]: AAA111: message-id=<m-1@example.com>
2025-02-01T10:00:01Z mx1 postfix/smtp[2]: AAA1110: to=<bob@example.org>, status=sent
2025-02-01T10:00:02Z mx1 postfix/qmgr[3]: AAA111: removed
";

    #[tokio::test]
    async fn missing_file_yields_no_entries() {
        let shell = Arc::new(FakeShell {
            missing: vec!["/var/log/missing.log".to_string()],
            ..FakeShell::default()
        });
        let source = source(shell.clone(), &["/var/log/missing.log"], None);

        let entries = source
            .query(&LogQuery::for_mail_id("AAA111"))
            .await
            .expect("missing file is not an error");

        assert!(entries.is_empty());
        assert_eq!(shell.calls().len(), 1);
    }

    #[tokio::test]
    async fn skips_missing_files_and_reads_the_rest() {
        let shell = Arc::new(FakeShell {
            missing: vec!["/var/log/mail.log.1".to_string()],
            stdout: LINES.to_string(),
            ..FakeShell::default()
        });
        let source = source(
            shell.clone(),
            &["/var/log/mail.log", "/var/log/mail.log.1"],
            None,
        );

        let entries = source
            .query(&LogQuery::for_mail_id("AAA111"))
            .await
            .expect("query should succeed");

        // AAA1110 passes grep -F but not the exact id filter
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.mail_id.as_deref() == Some("AAA111")));

        let reads: Vec<String> = shell
            .calls()
            .into_iter()
            .map(|(command, _)| command)
            .filter(|command| !command.starts_with("stat"))
            .collect();
        assert_eq!(
            reads,
            vec!["cat -- '/var/log/mail.log' | grep -F -e 'AAA111'".to_string()]
        );
    }

    #[tokio::test]
    async fn permission_denied_is_a_query_error() {
        let shell = Arc::new(FakeShell { denied: true, ..FakeShell::default() });
        let source = source(shell, &["/var/log/mail.log"], None);

        let err = source
            .query(&LogQuery::default())
            .await
            .expect_err("denied read should fail");
        assert_eq!(err.code(), "QUERY");
        assert!(err.suggestion().contains("sudo"));
    }

    #[tokio::test]
    async fn sudo_password_goes_to_stdin() {
        let shell = Arc::new(FakeShell { stdout: LINES.to_string(), ..FakeShell::default() });
        let source = source(
            shell.clone(),
            &["/var/log/mail.log"],
            Some(Some("s3cret".to_string())),
        );

        source.query(&LogQuery::default()).await.expect("query should succeed");

        for (command, stdin) in shell.calls() {
            assert!(command.starts_with("sudo -S -p '' "), "{command}");
            assert_eq!(stdin.as_deref(), Some("s3cret\n"));
        }
    }

    #[tokio::test]
    async fn unparsable_output_is_a_parse_error() {
        let shell = Arc::new(FakeShell {
            stdout: "garbage\nmore garbage\n".to_string(),
            ..FakeShell::default()
        });
        let source = source(shell, &["/var/log/mail.log"], None);

        let err = source
            .query(&LogQuery::default())
            .await
            .expect_err("all lines bad");
        assert_eq!(err.code(), "PARSE");
    }

    #[tokio::test]
    async fn one_bad_line_does_not_abort_the_batch() {
        let shell = Arc::new(FakeShell {
            stdout: format!("-- rotated --\n{LINES}"),
            ..FakeShell::default()
        });
        let source = source(shell, &["/var/log/mail.log"], None);

        let entries = source.query(&LogQuery::default()).await.expect("query");
        assert_eq!(entries.len(), 3);
    }

    #[test]
    fn keyword_and_window_pipeline() {
        let shell = Arc::new(FakeShell::default());
        let source = source(shell, &["/var/log/mail.log"], None);
        let time = NaiveDateTime::parse_from_str("2025-02-01 10:00:00", "%Y-%m-%d %H:%M:%S")
            .expect("time");
        let query = LogQuery::for_keywords(
            vec!["bob@example.org".to_string(), "it's".to_string()],
            Some(TimeWindow::Around {
                time,
                range: TimeDelta::try_minutes(10).expect("range"),
            }),
        );

        let command = source
            .read_command("/var/log/mail.log", &query)
            .expect("command should build");
        assert_eq!(
            command,
            "awk -v start='2025-02-01T09:50:00' -v end='2025-02-01T10:10:00' \
             '{ ts = substr($0, 1, 19); if (ts >= start && ts <= end) print }' \
             '/var/log/mail.log' | grep -iF -e 'bob@example.org' | grep -iF -e 'it'\\''s'"
        );
    }

    #[test]
    fn absolute_window_uses_host_offset_and_open_end() {
        let shell = Arc::new(FakeShell::default());
        let settings = HostSettings {
            time_zone: "+03:00".to_string(),
            log_parser: LineFormat::Compact,
            ..host_settings(&["/var/log/mail.log"])
        };
        let source = ShellSource::with_shell("mx1", settings, None, shell)
            .expect("source");
        let start = DateTime::parse_from_rfc3339("2025-02-01T07:00:00Z")
            .expect("start")
            .with_timezone(&Utc);
        let query = LogQuery::between(start, start + TimeDelta::try_minutes(1).expect("min"));

        let command = source.read_command("/var/log/mail.log", &query).expect("command");
        assert!(command.contains("start='2025-02-01T10:00:00'"), "{command}");
        assert!(command.contains("ts < end"), "{command}");
    }

    #[test]
    fn default_window_keeps_compact_lines_inside_it() {
        let shell = Arc::new(FakeShell::default());
        let source = source(shell, &["/var/log/mail.log"], None);
        let time = NaiveDateTime::parse_from_str("2025-02-01 10:00:00", "%Y-%m-%d %H:%M:%S")
            .expect("time");
        let window = TimeWindow::Around { time, range: TimeDelta::try_minutes(10).expect("range") };

        let (start, end) = window.local_bounds(source.offset);
        let start = source.format_bound(start).expect("start bound");
        let end = source.format_bound(end).expect("end bound");
        let prefix: String = "2025-02-01T10:05:00.123456+00:00 mx1 postfix/smtp[2]: AAA111: sent"
            .chars()
            .take(start.chars().count())
            .collect();

        assert_eq!(start, "2025-02-01T09:50:00");
        assert!(prefix >= start && prefix <= end, "{prefix} outside {start}..{end}");
        let late: String = "2025-02-01T10:10:01Z".chars().take(19).collect();
        assert!(late > end);
    }

    #[test]
    fn ssh_exit_255_is_classified() {
        let auth = classify_ssh_failure("mx1", "ops", "ops@mx1: Permission denied (publickey).");
        assert_eq!(auth.code(), "CONNECTION_AUTH");
        let network = classify_ssh_failure("mx1", "ops", "ssh: connect to host mx1 port 22: Connection refused");
        assert_eq!(network.code(), "CONNECTION_NETWORK");
    }
}
