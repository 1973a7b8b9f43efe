use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use qdma_core::{ControlServer, DeviceConfig, DriverRegistry, HostPages, SoftEngine};
use qdmactl::client::Channel;
use qdmactl::cmd::{self, Command};
use qdmactl::Session;

/// Hands requests straight to an in-process control server.
struct Loopback(Arc<ControlServer>);

impl Channel for Loopback {
    fn transact(&mut self, req: &[u8], reply_len: usize) -> io::Result<Vec<u8>> {
        let mut reply = self.0.handle(req);
        reply.truncate(reply_len);
        Ok(reply)
    }
}

fn pf_server() -> Arc<ControlServer> {
    let registry = Arc::new(DriverRegistry::init(
        Arc::new(SoftEngine::new()),
        Arc::new(HostPages::new()),
        false,
    ));
    let conf = DeviceConfig {
        pci_bus: 0x3b,
        pci_func: 1,
        qsets_max: 16,
        ..DeviceConfig::default()
    };
    registry.attach(&conf).unwrap();
    Arc::new(ControlServer::new(registry))
}

fn session(srv: &Arc<ControlServer>, sysfs: &Path) -> Session<'static> {
    let srv = srv.clone();
    Session::new(
        move |vf| {
            if vf {
                Err(io::ErrorKind::ConnectionRefused.into())
            } else {
                Ok(Box::new(Loopback(srv.clone())) as Box<dyn Channel>)
            }
        },
        sysfs.to_owned(),
    )
}

fn run(session: &mut Session<'_>, line: &str) -> anyhow::Result<String> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let command = cmd::parse(&words)?;
    let mut out = Vec::new();
    session.execute(&command, &mut out)?;
    Ok(String::from_utf8(out).unwrap())
}

/// Fake `resource<bar>` file of `len` bytes for 0000:3b:00.1.
fn fake_bar(sysfs: &Path, bar: u8, len: u64) -> std::path::PathBuf {
    let dir = sysfs.join("bus/pci/devices/0000:3b:00.1");
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("resource{}", bar));
    let file = fs::File::create(&path).unwrap();
    file.set_len(len).unwrap();
    path
}

#[test]
fn test_dev_list_skips_missing_vf_driver() {
    let sysfs = tempfile::tempdir().unwrap();
    let mut s = session(&pf_server(), sysfs.path());
    let out = run(&mut s, "dev list").unwrap();
    assert_eq!(out, "\nqdma0\t0000:3b:00.1\tmax QP: 16\n\n");
}

#[test]
fn test_unreachable_vf_driver() {
    let sysfs = tempfile::tempdir().unwrap();
    let mut s = session(&pf_server(), sysfs.path());
    let err = run(&mut s, "qdmavf0 q list").unwrap_err();
    assert!(format!("{:#}", err).contains("xnl_vf: driver not reachable"));
}

#[test]
fn test_dev_info_line() {
    let sysfs = tempfile::tempdir().unwrap();
    let mut s = session(&pf_server(), sysfs.path());
    let out = run(&mut s, "qdma0").unwrap();
    assert_eq!(
        out,
        "qdma0:\t3b:00.01\tconfig bar: 0, user bar: 2, max #. QP: 16\n"
    );

    let err = run(&mut s, "qdma7").unwrap_err();
    assert!(format!("{:#}", err).starts_with("qdma7: "));
}

#[test]
fn test_queue_add_dump_del() {
    let srv = pf_server();
    let sysfs = tempfile::tempdir().unwrap();
    let mut s = session(&srv, sysfs.path());

    let out = run(&mut s, "qdma0 q add idx 3 mode st dir c2h").unwrap();
    assert!(out.contains("\nqdma0-ST-C2H-3 added"));
    assert!(srv.registry().class().contains("qdma0-ST-C2H-3"));

    let out = run(&mut s, "qdma0 q dump idx 3 mode st dir c2h").unwrap();
    assert!(out.contains("wrbsz 3"));

    let err = run(&mut s, "qdma0 q add idx 3 mode st dir c2h").unwrap_err();
    assert!(format!("{:#}", err).contains("QID 3 already configured"));

    let out = run(&mut s, "qdma0 q del idx 3 mode st dir c2h").unwrap();
    assert!(out.contains("deleted"));

    let err = run(&mut s, "qdma0 q dump idx 3 mode st dir c2h").unwrap_err();
    assert!(format!("{:#}", err).contains("qdma0 Q_DUMP"));
}

#[test]
fn test_reg_read_through_sysfs() {
    let sysfs = tempfile::tempdir().unwrap();
    let path = fake_bar(sysfs.path(), 2, 0x1000);
    let mut bytes = fs::read(&path).unwrap();
    bytes[0x204..0x208].copy_from_slice(&0xcafe_u32.to_le_bytes());
    fs::write(&path, &bytes).unwrap();

    let mut s = session(&pf_server(), sysfs.path());
    let out = run(&mut s, "qdma0 reg read bar 2 0x204").unwrap();
    assert!(out.ends_with("qdma0, 3b:00.01, bar#2, 0x204 = 0xcafe.\n"));

    let out = run(&mut s, "qdma0 reg write bar 2 0x10 7").unwrap();
    assert!(out.ends_with("reg 0x10 -> 0x7, read back 0x7.\n"));
    assert_eq!(&fs::read(&path).unwrap()[0x10..0x14], &7u32.to_le_bytes());

    // config BAR is the default and has no resource file here
    let err = run(&mut s, "qdma0 reg read 0x0").unwrap_err();
    assert!(format!("{:#}", err).contains("bar 0 not accessible"));
}

#[test]
fn test_reg_dump_through_sysfs() {
    let sysfs = tempfile::tempdir().unwrap();
    fake_bar(sysfs.path(), 0, 0x10000);
    fake_bar(sysfs.path(), 2, 0x1000);

    let mut s = session(&pf_server(), sysfs.path());
    let out = run(&mut s, "qdma0 reg dump").unwrap();
    assert!(out.contains("qdma0, pci 3b:00.01, reg dump"));
    assert!(out.contains("USER BAR #2"));
    assert!(out.contains("CONFIG BAR #0"));
    assert!(out.contains("GLBL_SCRATCH"));
}

#[test]
fn test_help_and_version() {
    let sysfs = tempfile::tempdir().unwrap();
    let mut s = session(&pf_server(), sysfs.path());
    let mut out = Vec::new();
    s.execute(&Command::Help, &mut out).unwrap();
    assert!(String::from_utf8(out).unwrap().starts_with("Usage: qdmactl"));

    let out = run(&mut s, "--version").unwrap();
    assert!(out.starts_with("qdmactl 0."));
}
