#![cfg(unix)]

use office_batch::{
    config::Config,
    engine::{soffice::SofficeEngine, ConversionRequest, Engine},
};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tempfile::TempDir;

// Writing a script while another test forks can leave the file busy (ETXTBSY).
static SERIAL: Mutex<()> = Mutex::new(());

const WRITE_PDF: &str = r#"
if [ "$1" = "--version" ]; then
  echo "LibreOffice 7.6.4.1 fake"
  exit 0
fi
out="$5"
in="$6"
name=$(basename "$in")
printf '%%PDF-1.4\n' > "$out/${name%.*}.pdf"
echo "convert $in -> $out/${name%.*}.pdf"
"#;

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    fn input(&self, name: &str) -> PathBuf {
        let dir = self.path("input");
        std::fs::create_dir_all(&dir).unwrap();
        let p = dir.join(name);
        std::fs::write(&p, b"not really an office document").unwrap();
        p
    }

    fn script(&self, body: &str) -> PathBuf {
        let p = self.path("fake-soffice");
        std::fs::write(&p, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&p, std::fs::Permissions::from_mode(0o755)).unwrap();
        p
    }

    fn engine(&self, script: &Path) -> SofficeEngine {
        let mut cfg = Config::default();
        cfg.engine.executable = script.display().to_string();
        SofficeEngine::new(&cfg)
    }
}

#[test]
fn converts_and_verifies_artifact() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let fx = Fixture::new();
    let engine = fx.engine(&fx.script(WRITE_PDF));
    let input = fx.input("report.docx");

    let pdf = engine
        .convert(&ConversionRequest::new(&input, fx.path("output")))
        .expect("conversion succeeds");

    assert_eq!(pdf.file_name().unwrap(), "report.pdf");
    assert!(fx.path("output/report.pdf").is_file());
}

#[test]
fn missing_input_fails_before_launch() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let fx = Fixture::new();
    let marker = fx.path("launched");
    let engine = fx.engine(&fx.script(&format!("touch '{}'\nexit 0", marker.display())));

    let err = engine
        .convert(&ConversionRequest::new(fx.path("input/nope.docx"), fx.path("output")))
        .unwrap_err();

    assert!(err.message().starts_with("input file does not exist: "), "{err}");
    assert!(err.message().contains("nope.docx"));
    assert!(!marker.exists());
}

#[test]
fn exit_zero_without_pdf_is_a_failure() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let fx = Fixture::new();
    let engine = fx.engine(&fx.script("echo 'all good'\nexit 0"));
    let input = fx.input("sheet.xlsx");

    let err = engine
        .convert(&ConversionRequest::new(&input, fx.path("output")))
        .unwrap_err();

    assert!(err.message().contains("exit code: 0"), "{err}");
    assert!(err.message().contains("all good"));
    assert!(!fx.path("output/sheet.pdf").exists());
}

#[test]
fn non_zero_exit_reports_code_and_streams() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let fx = Fixture::new();
    let engine = fx.engine(&fx.script("echo 'source file could not be loaded' >&2\nexit 1"));
    let input = fx.input("slides.pptx");

    let err = engine
        .convert(&ConversionRequest::new(&input, fx.path("output")))
        .unwrap_err();

    assert!(err.message().contains("exit code: 1"), "{err}");
    assert!(err.message().contains("source file could not be loaded"));
}

#[test]
fn pdf_left_by_failing_engine_is_not_trusted() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let fx = Fixture::new();
    let engine = fx.engine(&fx.script(&format!("{WRITE_PDF}\nexit 3")));
    let input = fx.input("memo.doc");

    let err = engine
        .convert(&ConversionRequest::new(&input, fx.path("output")))
        .unwrap_err();

    assert!(err.message().contains("exit code: 3"), "{err}");
}

#[test]
fn undecodable_output_is_replaced() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let fx = Fixture::new();
    let engine = fx.engine(&fx.script("printf 'bad \\377\\376 bytes' >&2\nexit 2"));
    let input = fx.input("legacy.xls");

    let err = engine
        .convert(&ConversionRequest::new(&input, fx.path("output")))
        .unwrap_err();

    assert!(err.message().contains("exit code: 2"), "{err}");
    assert!(err.message().contains("bad "));
    assert!(err.message().contains('\u{FFFD}'));
}

#[test]
fn timeout_kills_and_reaps_the_engine() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let fx = Fixture::new();
    let engine = fx.engine(&fx.script("echo $$ > \"$5/engine.pid\"\nexec sleep 30"));
    let input = fx.input("huge.docx");

    let started = Instant::now();
    let err = engine
        .convert(
            &ConversionRequest::new(&input, fx.path("output"))
                .with_timeout(Duration::from_secs(1)),
        )
        .unwrap_err();

    assert_eq!(err.message(), "conversion timed out after 1s");
    assert!(started.elapsed() < Duration::from_secs(10));

    if cfg!(target_os = "linux") {
        let pid = std::fs::read_to_string(fx.path("output/engine.pid")).unwrap();
        assert!(!Path::new(&format!("/proc/{}", pid.trim())).exists());
    }
}

/// True once `pid` has exited; an unreaped zombie counts as gone.
fn process_gone(pid: &str) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let gone = match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Err(_) => true,
            Ok(stat) => stat
                .rsplit_once(')')
                .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
        };
        if gone || Instant::now() >= deadline {
            return gone;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn timeout_also_kills_processes_the_engine_started() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let fx = Fixture::new();
    // Mimics the soffice wrapper forking soffice.bin and waiting on it.
    let engine = fx.engine(&fx.script("sleep 30 &\necho $! > \"$5/renderer.pid\"\nwait"));
    let input = fx.input("deck.pptx");

    let started = Instant::now();
    let err = engine
        .convert(
            &ConversionRequest::new(&input, fx.path("output"))
                .with_timeout(Duration::from_secs(1)),
        )
        .unwrap_err();

    assert_eq!(err.message(), "conversion timed out after 1s");
    assert!(started.elapsed() < Duration::from_secs(10));

    if cfg!(target_os = "linux") {
        let pid = std::fs::read_to_string(fx.path("output/renderer.pid")).unwrap();
        assert!(process_gone(pid.trim()), "renderer {} still running", pid.trim());
    }
}

#[test]
fn reconverting_into_existing_dir_is_idempotent() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let fx = Fixture::new();
    let engine = fx.engine(&fx.script(WRITE_PDF));
    let input = fx.input("report.docx");
    let req = ConversionRequest::new(&input, fx.path("output"));

    let first = engine.convert(&req).unwrap();
    let second = engine.convert(&req).unwrap();
    assert_eq!(first, second);
}

#[test]
fn output_dir_creation_failure() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let fx = Fixture::new();
    let engine = fx.engine(&fx.script(WRITE_PDF));
    let input = fx.input("report.docx");
    std::fs::write(fx.path("blocker"), b"").unwrap();

    let err = engine
        .convert(&ConversionRequest::new(&input, fx.path("blocker/output")))
        .unwrap_err();

    assert!(err.message().starts_with("failed to create output directory: "), "{err}");
}

#[test]
fn unconfigured_executable_is_a_launch_failure() {
    let fx = Fixture::new();
    let engine = SofficeEngine::new(&Config::default()).with_executable(None);
    let input = fx.input("report.docx");

    let err = engine
        .convert(&ConversionRequest::new(&input, fx.path("output")))
        .unwrap_err();

    assert!(err.message().starts_with("conversion error: "), "{err}");
    assert!(err.message().contains("LIBREOFFICE_PATH"));
}

#[test]
fn missing_executable_is_a_launch_failure() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let fx = Fixture::new();
    let engine = fx.engine(&fx.path("no-such-soffice"));
    let input = fx.input("report.docx");

    let err = engine
        .convert(&ConversionRequest::new(&input, fx.path("output")))
        .unwrap_err();

    assert!(err.message().starts_with("conversion error: "), "{err}");
    assert!(err.message().contains("no-such-soffice"));
}

#[test]
fn configured_env_reaches_the_engine() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let fx = Fixture::new();
    let script = fx.script(&format!("[ \"$OFFICE_BATCH_TEST\" = yes ] || exit 9\n{WRITE_PDF}"));
    let mut cfg = Config::default();
    cfg.engine.executable = script.display().to_string();
    cfg.engine
        .env
        .insert("OFFICE_BATCH_TEST".into(), "yes".into());
    let engine = SofficeEngine::new(&cfg);
    let input = fx.input("report.docx");

    engine
        .convert(&ConversionRequest::new(&input, fx.path("output")))
        .expect("env var visible to the engine");
}

#[test]
fn doctor_reports_version() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let fx = Fixture::new();
    let engine = fx.engine(&fx.script(WRITE_PDF));

    let diag = engine.doctor().unwrap();
    assert!(diag.ok, "{:?}", diag.error);
    assert_eq!(diag.version.as_deref(), Some("LibreOffice 7.6.4.1 fake"));
}

#[test]
fn doctor_without_executable() {
    let engine = SofficeEngine::new(&Config::default()).with_executable(None);
    let diag = engine.doctor().unwrap();
    assert!(!diag.ok);
    assert!(diag.executable.is_none());
}
