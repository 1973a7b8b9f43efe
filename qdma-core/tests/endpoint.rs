use std::io::SeekFrom;
use std::sync::Arc;

use qdma_core::cdev::SEEK_END_BASE;
use qdma_core::{
    DeviceConfig, Direction, DriverRegistry, HostPages, QueueConfig, QueueMode, SoftEngine,
};

fn setup() -> (Arc<HostPages>, DriverRegistry) {
    let pages = Arc::new(HostPages::new());
    let registry = DriverRegistry::init(Arc::new(SoftEngine::new()), pages.clone(), false);
    registry.attach(&DeviceConfig::default()).unwrap();
    (pages, registry)
}

fn add_started(registry: &DriverRegistry, qidx: u32, mode: QueueMode, dir: Direction) {
    let dev = registry.get(0).unwrap();
    dev.add(&QueueConfig::new(qidx, mode, dir)).unwrap();
    dev.start(qidx, dir).unwrap();
}

#[test]
fn test_mm_write_then_read_back() {
    let (pages, registry) = setup();
    add_started(&registry, 0, QueueMode::MemoryMapped, Direction::H2C);
    add_started(&registry, 0, QueueMode::MemoryMapped, Direction::C2H);

    let data: Vec<u8> = (0..10_000u32).map(|i| (i * 7) as u8).collect();
    let mut h2c = registry.class().open("qdma0-MM-H2C-0").unwrap();
    h2c.seek(SeekFrom::Start(0x1000)).unwrap();
    assert_eq!(h2c.write(&data).unwrap(), data.len());
    assert_eq!(h2c.position(), 0x1000);

    let mut c2h = registry.class().open("qdma0-MM-C2H-0").unwrap();
    c2h.seek(SeekFrom::Start(0x1000)).unwrap();
    let mut back = vec![0u8; data.len()];
    assert_eq!(c2h.read(&mut back).unwrap(), data.len());
    assert_eq!(back, data);
    assert_eq!(c2h.position(), 0x1000);

    assert_eq!(pages.pinned(), 0);
    assert!(pages.dirtied() > 0);
}

#[test]
fn test_st_packet_loopback() {
    let (pages, registry) = setup();
    add_started(&registry, 1, QueueMode::Streaming, Direction::H2C);
    add_started(&registry, 1, QueueMode::Streaming, Direction::C2H);

    let mut h2c = registry.class().open("qdma0-ST-H2C-1").unwrap();
    let mut c2h = registry.class().open("qdma0-ST-C2H-1").unwrap();
    h2c.write(b"first packet").unwrap();
    h2c.write(b"second").unwrap();

    let mut buf = [0u8; 64];
    let n = c2h.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"first packet");
    let n = c2h.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"second");

    let err = c2h.read(&mut buf).unwrap_err();
    assert_eq!(err.errno(), libc::ETIMEDOUT);
    assert_eq!(pages.pinned(), 0);
}

#[test]
fn test_wrong_direction_refused() {
    let (pages, registry) = setup();
    add_started(&registry, 2, QueueMode::MemoryMapped, Direction::C2H);
    let mut c2h = registry.class().open("qdma0-MM-C2H-2").unwrap();
    assert!(c2h.write(&[1, 2, 3, 4]).is_err());
    assert_eq!(pages.pinned(), 0);
}

#[test]
fn test_stopped_queue_refuses_io() {
    let (_pages, registry) = setup();
    let dev = registry.get(0).unwrap();
    dev.add(&QueueConfig::new(0, QueueMode::MemoryMapped, Direction::H2C))
        .unwrap();
    let mut h2c = registry.class().open("qdma0-MM-H2C-0").unwrap();
    assert!(h2c.write(&[0u8; 8]).is_err());

    dev.start(0, Direction::H2C).unwrap();
    assert_eq!(h2c.write(&[0u8; 8]).unwrap(), 8);
    dev.stop(0, Direction::H2C).unwrap();
    assert!(h2c.write(&[0u8; 8]).is_err());
}

#[test]
fn test_seek_rules() {
    let (_pages, registry) = setup();
    add_started(&registry, 0, QueueMode::MemoryMapped, Direction::H2C);
    let mut file = registry.class().open("qdma0-MM-H2C-0").unwrap();

    assert_eq!(file.seek(SeekFrom::Start(100)).unwrap(), 100);
    assert_eq!(file.seek(SeekFrom::Current(-40)).unwrap(), 60);
    assert!(file.seek(SeekFrom::Current(-61)).is_err());
    assert_eq!(file.position(), 60);
    assert_eq!(file.seek(SeekFrom::End(0)).unwrap(), SEEK_END_BASE);
    assert_eq!(file.seek(SeekFrom::End(-15)).unwrap(), SEEK_END_BASE - 15);
}

#[test]
fn test_transfer_beyond_card_memory() {
    let (pages, registry) = setup();
    add_started(&registry, 0, QueueMode::MemoryMapped, Direction::H2C);
    let mut file = registry.class().open("qdma0-MM-H2C-0").unwrap();
    file.seek(SeekFrom::Start((1 << 20) - 4)).unwrap();
    let err = file.write(&[0u8; 8]).unwrap_err();
    assert_eq!(err.errno(), libc::EINVAL);
    assert_eq!(pages.pinned(), 0);
}
