use serde_json::Value;
use std::ffi::OsStr;
use std::fs;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

struct TempDirGuard {
    path: PathBuf,
}

impl TempDirGuard {
    fn new(prefix: &str) -> Self {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be after unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!(
            "scv-cli-{prefix}-{}-{unique}",
            std::process::id()
        ));
        fs::create_dir_all(&path).expect("temp dir should be created");
        Self { path }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempDirGuard {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

struct ChildGuard(Child);

impl Drop for ChildGuard {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn run_scv<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let bin = env!("CARGO_BIN_EXE_scv");
    Command::new(bin)
        .args(args)
        .env_remove("SCV_CONFIG")
        .output()
        .expect("scv command should execute")
}

fn assert_success(output: &Output) {
    if !output.status.success() {
        panic!(
            "command failed with status {:?}\nstdout:\n{}\nstderr:\n{}",
            output.status.code(),
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr),
        );
    }
}

fn assert_failure(output: &Output) {
    if output.status.success() {
        panic!(
            "command unexpectedly succeeded\nstdout:\n{}\nstderr:\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr),
        );
    }
}

fn write_config(dir: &Path, bind: &str) -> PathBuf {
    let path = dir.join("scv.toml");
    let data_dir = dir.join("data");
    let text = format!(
        r#"name = "smoke"
bind = "{bind}"
data_dir = "{}"
activation_password = "hunter2"
expiration_seconds = 60

[[users]]
id = "alice"
token = "alice-token"
manager = true
"#,
        data_dir.display()
    );
    fs::write(&path, text).expect("config should be written");
    path
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("ephemeral port should bind")
        .local_addr()
        .expect("local addr")
        .port()
}

fn http_get(addr: &str, path: &str) -> Option<String> {
    let mut stream = TcpStream::connect(addr).ok()?;
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .ok()?;
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).ok()?;
    let mut response = String::new();
    stream.read_to_string(&mut response).ok()?;
    Some(response)
}

#[test]
fn check_config_json_redacts_secrets() {
    let tmp = TempDirGuard::new("check-json");
    let config = write_config(tmp.path(), "127.0.0.1:12345");

    let output = run_scv([
        OsStr::new("check-config"),
        OsStr::new("--config"),
        config.as_os_str(),
        OsStr::new("--json"),
    ]);
    assert_success(&output);

    let payload: Value =
        serde_json::from_slice(&output.stdout).expect("check-config should print JSON");
    assert_eq!(payload["name"], "smoke");
    assert_eq!(payload["expirationSeconds"], 60);
    assert_eq!(payload["maxStreamFails"], 10);
    assert_eq!(payload["users"][0]["id"], "alice");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(!stdout.contains("hunter2"));
    assert!(!stdout.contains("alice-token"));
}

#[test]
fn check_config_text_summary() {
    let tmp = TempDirGuard::new("check-text");
    let config = write_config(tmp.path(), "127.0.0.1:12345");

    let output = run_scv([
        OsStr::new("check-config"),
        OsStr::new("--config"),
        config.as_os_str(),
    ]);
    assert_success(&output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Name: smoke"));
    assert!(stdout.contains("Users: 1 (1 managers)"));
    assert!(stdout.contains("Result: ok"));
}

#[test]
fn check_config_rejects_invalid_files() {
    let tmp = TempDirGuard::new("check-invalid");

    let missing = run_scv([
        OsStr::new("check-config"),
        OsStr::new("--config"),
        tmp.path().join("absent.toml").as_os_str(),
    ]);
    assert_failure(&missing);

    let bad = tmp.path().join("bad.toml");
    fs::write(&bad, "name = \"x\"\nactivation_password = \"\"\n").expect("write config");
    let output = run_scv([
        OsStr::new("check-config"),
        OsStr::new("--config"),
        bad.as_os_str(),
    ]);
    assert_failure(&output);
    assert!(String::from_utf8_lossy(&output.stderr).contains("activation_password"));
}

#[test]
fn serve_answers_healthz() {
    let tmp = TempDirGuard::new("serve");
    let config = write_config(tmp.path(), "127.0.0.1:1");
    let addr = format!("127.0.0.1:{}", free_port());

    let child = Command::new(env!("CARGO_BIN_EXE_scv"))
        .args([
            OsStr::new("serve"),
            OsStr::new("--config"),
            config.as_os_str(),
            OsStr::new("--bind"),
            OsStr::new(&addr),
        ])
        .env_remove("SCV_CONFIG")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("scv serve should spawn");
    let _guard = ChildGuard(child);

    let deadline = Instant::now() + Duration::from_secs(10);
    let response = loop {
        if let Some(response) = http_get(&addr, "/healthz") {
            break response;
        }
        assert!(Instant::now() < deadline, "server never answered on {addr}");
        thread::sleep(Duration::from_millis(50));
    };
    assert!(
        response.starts_with("HTTP/1.1 200"),
        "unexpected response: {response}"
    );
    assert!(tmp.path().join("data").is_dir());
}
