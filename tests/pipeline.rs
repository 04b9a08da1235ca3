//! End-to-end provisioning pipeline tests: a local HTTP server serves a tiny
//! rootfs archive and a stub tool stands in for proot, so a full run can be
//! driven from nothing to ready without network access or a real sandbox.

use std::fs;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Builder, EntryType, Header};

use prootbox::error::ProvisionError;
use prootbox::events::{OutputTap, ProgressEvent, ProgressReporter, RunToken};
use prootbox::provision::{Distribution, ProvisionConfig, Provisioner, Registry};
use prootbox::EnvStatus;

/// Minimal rootfs archive: a shell and one config file.
fn build_rootfs_archive() -> Vec<u8> {
    let mut builder = Builder::new(GzEncoder::new(Vec::new(), Compression::fast()));

    let mut dir = Header::new_gnu();
    dir.set_entry_type(EntryType::Directory);
    dir.set_size(0);
    dir.set_mode(0o755);
    dir.set_cksum();
    builder
        .append_data(&mut dir, "bin", std::io::empty())
        .expect("append failed");

    let shell = b"#!/bin/sh\n";
    let mut file = Header::new_gnu();
    file.set_entry_type(EntryType::Regular);
    file.set_size(shell.len() as u64);
    file.set_mode(0o755);
    file.set_cksum();
    builder
        .append_data(&mut file, "bin/sh", &shell[..])
        .expect("append failed");

    builder
        .into_inner()
        .expect("finish tar failed")
        .finish()
        .expect("finish gzip failed")
}

/// Serves one HTTP 200 response carrying `body`, then exits.
fn serve_bytes(body: Vec<u8>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind stub server");
    let url = format!("http://{}/rootfs.tar.gz", listener.local_addr().expect("local addr"));

    thread::spawn(move || {
        let Ok((mut stream, _)) = listener.accept() else {
            return;
        };
        let mut buf = [0u8; 4096];
        let _ = stream.read(&mut buf);
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        let _ = stream.write_all(head.as_bytes());
        let _ = stream.write_all(&body);
    });

    url
}

/// A stand-in for the sandbox tool that reports success without sandboxing
/// anything; the pipeline only cares about its exit code.
fn write_stub_tool(dir: &Path) -> std::path::PathBuf {
    let tool = dir.join("proot");
    fs::write(&tool, "#!/bin/sh\nexit 0\n").expect("write failed");
    fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).expect("chmod failed");
    tool
}

#[test]
fn full_run_produces_a_ready_environment() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let base = dir.path().join("envs");
    let config = ProvisionConfig::default()
        .with_base_dir(&base)
        .with_tool_path(write_stub_tool(dir.path()))
        .with_sources_override(vec![serve_bytes(build_rootfs_archive())]);
    let provisioner = Provisioner::new(config);

    let (tx, rx) = mpsc::channel::<ProgressEvent>();
    let env = provisioner
        .provision(
            "env1",
            Distribution::Alpine,
            &RunToken::new(),
            &ProgressReporter::new(tx),
            &OutputTap::disabled(),
        )
        .expect("provisioning should succeed");

    assert_eq!(env.id, "env1");
    assert_eq!(env.status, EnvStatus::Ready);
    assert!(env.installed_at.is_some());
    assert!(env.root_path.join("bin/sh").exists());

    // The transient download artifact is cleaned up.
    assert!(!base.join("env1/rootfs.tar.gz").exists());

    // DNS configuration was written into the rootfs.
    let resolv = fs::read_to_string(env.root_path.join("etc/resolv.conf")).expect("read failed");
    assert!(resolv.contains("nameserver"));

    // The registry now derives this environment as installed, and its
    // metadata reached the terminal state.
    let registry = Registry::new(&base);
    assert!(registry.exists("env1"));
    let meta = registry.load_metadata("env1").expect("metadata should load");
    assert_eq!(meta.status, EnvStatus::Ready);

    // Progress is monotonic, in range, and finishes at 1.0.
    let bar: Vec<f32> = rx
        .try_iter()
        .filter(|e| !e.is_out_of_band())
        .map(|e| e.fraction)
        .collect();
    assert!(!bar.is_empty());
    let mut previous = 0.0_f32;
    for fraction in &bar {
        assert!((0.0..=1.0).contains(fraction));
        assert!(*fraction >= previous, "fraction went backwards");
        previous = *fraction;
    }
    assert_eq!(*bar.last().expect("non-empty"), 1.0);
}

#[test]
fn missing_tool_fails_before_any_download() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let config = ProvisionConfig::default()
        .with_base_dir(dir.path().join("envs"))
        .with_tool_path("/nonexistent/proot")
        .with_sources_override(vec!["http://127.0.0.1:1/never-touched.tar.gz".to_string()]);
    let provisioner = Provisioner::new(config);

    let err = provisioner
        .provision(
            "env1",
            Distribution::Alpine,
            &RunToken::new(),
            &ProgressReporter::disabled(),
            &OutputTap::disabled(),
        )
        .unwrap_err();
    assert!(matches!(err, ProvisionError::ToolMissing { .. }));
}

#[test]
fn cancellation_mid_download_is_terminal_and_clean() {
    // A server that trickles bytes forever, and a token flipped shortly
    // after the run starts.
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind stub server");
    let url = format!("http://{}/rootfs.tar.gz", listener.local_addr().expect("local addr"));
    thread::spawn(move || {
        let Ok((mut stream, _)) = listener.accept() else {
            return;
        };
        let mut buf = [0u8; 4096];
        let _ = stream.read(&mut buf);
        let _ = stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 10485760\r\n\r\n");
        loop {
            if stream.write_all(&[0u8; 1024]).is_err() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
    });

    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let base = dir.path().join("envs");
    let config = ProvisionConfig::default()
        .with_base_dir(&base)
        .with_tool_path(write_stub_tool(dir.path()))
        .with_sources_override(vec![url]);
    let provisioner = Provisioner::new(config);

    let token = RunToken::new();
    let canceller = token.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        canceller.cancel();
    });

    let err = provisioner
        .provision(
            "env1",
            Distribution::Alpine,
            &token,
            &ProgressReporter::disabled(),
            &OutputTap::disabled(),
        )
        .unwrap_err();

    assert!(matches!(err, ProvisionError::Cancelled));
    assert!(!base.join("env1/rootfs.tar.gz").exists(), "no partial archive may remain");
    assert!(!Registry::new(&base).exists("env1"));

    // The terminal state is recorded in metadata for later inspection.
    let meta = Registry::new(&base).load_metadata("env1").expect("metadata should load");
    assert_eq!(meta.status, EnvStatus::Cancelled);
}
