use std::{
    cell::RefCell,
    collections::BTreeMap,
    fs,
    io::{self, Cursor, Read},
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use pretty_assertions::assert_eq;
use wledflasher::{
    error::ConnectionError,
    flash_data::{CompanionFiles, FlashParameters, Firmware},
    flasher::{ChipClient, Connector, FlashSize, ProgressCallbacks},
    image_format::Segment,
    serial::{PortCandidate, SelectedPort},
    session::{
        run_monitor, BaudFallback, FlashSession, Observer, SessionConfig, SessionState,
    },
    targets::{Chip, ChipInfo, Esp32Info, Esp8266Info},
    Error,
};

const ROM_BAUD: u32 = 115_200;

/// State of the simulated device, shared by the connector and its clients
struct Device {
    info: ChipInfo,
    flash_size: FlashSize,
    /// Highest baud rate the device can keep up with
    max_baud: u32,
    baud: u32,
    port_open: bool,
    stub_running: bool,
    /// Written flash contents by address
    flash: BTreeMap<u32, Vec<u8>>,
    /// Fail the next write of the segment at this offset, halfway through
    fail_write_at: Option<u32>,
    /// Close the port when asked to change the baud rate
    unplug_on_baud_change: bool,
    logs: Vec<u8>,
    events: Vec<String>,
}

impl Device {
    fn new(info: ChipInfo) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Device {
            info,
            flash_size: FlashSize::_4Mb,
            max_baud: 921_600,
            baud: ROM_BAUD,
            port_open: false,
            stub_running: false,
            flash: BTreeMap::new(),
            fail_write_at: None,
            unplug_on_baud_change: false,
            logs: b"ets Jan  8 2013,rst cause:2, boot mode:(3,6)\r\nESP32 boot\r\n".to_vec(),
            events: Vec::new(),
        }))
    }
}

struct MockConnector {
    ports: Vec<PortCandidate>,
    device: Rc<RefCell<Device>>,
}

impl MockConnector {
    fn new(device: &Rc<RefCell<Device>>) -> Self {
        MockConnector {
            ports: vec![PortCandidate::new(
                "/dev/ttyUSB0",
                Some("CP2102 USB to UART".into()),
            )],
            device: device.clone(),
        }
    }
}

impl Connector for MockConnector {
    type Client = MockClient;

    fn available_ports(&self) -> Result<Vec<PortCandidate>, Error> {
        Ok(self.ports.clone())
    }

    fn connect(&mut self, port: &str, chip: Option<Chip>) -> Result<MockClient, Error> {
        let mut device = self.device.borrow_mut();
        if device.port_open {
            return Err(Error::Connection(ConnectionError::ConnectionFailed));
        }

        device.events.push(format!("connect {port}"));
        let actual = device.info.chip();
        if chip.is_some_and(|chip| chip != actual) {
            return Err(Error::Connection(ConnectionError::ConnectionFailed));
        }

        device.port_open = true;
        device.stub_running = false;
        device.baud = ROM_BAUD;

        Ok(MockClient {
            device: self.device.clone(),
            chip: actual,
            writing: false,
        })
    }

    fn open_monitor(&mut self, port: &str, baud: u32) -> Result<Box<dyn Read + Send>, Error> {
        let mut device = self.device.borrow_mut();
        device.events.push(format!("monitor {port} {baud}"));

        Ok(Box::new(Cursor::new(device.logs.clone())))
    }
}

struct MockClient {
    device: Rc<RefCell<Device>>,
    chip: Chip,
    writing: bool,
}

impl MockClient {
    fn link_ok(device: &Device) -> Result<(), Error> {
        if device.baud > device.max_baud {
            Err(Error::from(io::Error::from(io::ErrorKind::TimedOut)))
        } else {
            Ok(())
        }
    }
}

impl Drop for MockClient {
    fn drop(&mut self) {
        self.device.borrow_mut().port_open = false;
    }
}

impl ChipClient for MockClient {
    fn chip(&self) -> Chip {
        self.chip
    }

    fn read_chip_info(&mut self) -> Result<ChipInfo, Error> {
        Ok(self.device.borrow().info.clone())
    }

    fn run_stub(&mut self) -> Result<(), Error> {
        let mut device = self.device.borrow_mut();
        device.events.push("stub".into());
        device.stub_running = true;
        Ok(())
    }

    fn change_baud(&mut self, baud: u32) -> Result<(), Error> {
        let mut device = self.device.borrow_mut();
        device.events.push(format!("baud {baud}"));
        if device.unplug_on_baud_change {
            return Err(Error::from(io::Error::from(io::ErrorKind::BrokenPipe)));
        }
        device.baud = baud;
        Ok(())
    }

    fn detect_flash_size(&mut self) -> Result<FlashSize, Error> {
        let mut device = self.device.borrow_mut();
        let baud = device.baud;
        device.events.push(format!("detect {baud}"));
        Self::link_ok(&device)?;
        Ok(device.flash_size)
    }

    fn set_flash_parameters(&mut self, size: FlashSize) -> Result<(), Error> {
        let mut device = self.device.borrow_mut();
        device.events.push(format!("params {size}"));
        Self::link_ok(&device)
    }

    fn erase_flash(&mut self) -> Result<(), Error> {
        let mut device = self.device.borrow_mut();
        device.events.push("erase".into());
        device.flash.clear();
        Ok(())
    }

    fn begin_flash(&mut self, _verify: bool) -> Result<(), Error> {
        assert!(self.device.borrow().stub_running, "flashing without stub");
        self.writing = true;
        Ok(())
    }

    fn write_segment(
        &mut self,
        segment: &Segment<'_>,
        progress: &mut Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        if !self.writing {
            return Err(Error::FlashNotStarted);
        }

        let mut device = self.device.borrow_mut();
        Self::link_ok(&device)?;
        device.events.push(format!("write {:#x}", segment.addr));

        let blocks = segment.data.chunks(0x4000).collect::<Vec<_>>();
        if let Some(cb) = progress.as_mut() {
            cb.init(segment.addr, blocks.len());
        }

        if device.fail_write_at.take() == Some(segment.addr) {
            let half = segment.data.len() / 2;
            device.flash.insert(segment.addr, segment.data[..half].to_vec());
            return Err(Error::from(io::Error::from(io::ErrorKind::TimedOut)));
        }

        for (i, _) in blocks.iter().enumerate() {
            if let Some(cb) = progress.as_mut() {
                cb.update(i + 1);
            }
        }
        if let Some(cb) = progress.as_mut() {
            cb.finish();
        }

        device.flash.insert(segment.addr, segment.data.to_vec());
        Ok(())
    }

    fn end_flash(&mut self) -> Result<(), Error> {
        self.writing = false;
        Ok(())
    }

    fn hard_reset(&mut self) -> Result<(), Error> {
        self.device.borrow_mut().events.push("reset".into());
        Ok(())
    }

    fn into_log_stream(self, baud: u32) -> Result<Box<dyn Read + Send>, Error> {
        let mut device = self.device.borrow_mut();
        device.events.push(format!("logs {baud}"));
        device.baud = baud;

        Ok(Box::new(Cursor::new(device.logs.clone())))
    }
}

#[derive(Default)]
struct Recorder {
    states: Vec<SessionState>,
    ports: Vec<SelectedPort>,
    infos: Vec<ChipInfo>,
    fallbacks: Vec<(u32, u32)>,
    params: Vec<(String, String)>,
    segments: Vec<(u32, usize)>,
    lines: Vec<String>,
}

impl Observer for Recorder {
    fn state_changed(&mut self, state: &SessionState) {
        self.states.push(state.clone());
    }

    fn port_selected(&mut self, port: &SelectedPort) {
        self.ports.push(port.clone());
    }

    fn chip_info(&mut self, info: &ChipInfo) {
        self.infos.push(info.clone());
    }

    fn baud_fallback(&mut self, rejected: u32, fallback: u32) {
        self.fallbacks.push((rejected, fallback));
    }

    fn flash_parameters(&mut self, params: &FlashParameters) {
        self.params
            .push((params.mode.to_string(), params.frequency.to_string()));
    }

    fn segment_started(&mut self, addr: u32, blocks: usize) {
        self.segments.push((addr, blocks));
    }

    fn log_line(&mut self, line: &str) {
        self.lines.push(line.to_string());
    }
}

fn esp8266_info() -> ChipInfo {
    ChipInfo::Esp8266(Esp8266Info {
        model: "ESP8266EX".into(),
        chip_id: 0x00c0_ffee,
        mac: "18:FE:34:C0:FF:EE".into(),
    })
}

fn esp32_info() -> ChipInfo {
    ChipInfo::Esp32(Esp32Info {
        model: "ESP32-D0WDQ6".into(),
        mac: "24:0A:C4:00:00:01".into(),
        cores: 2,
        cpu_frequency: 240,
        bluetooth: true,
        embedded_flash: false,
        adc_calibrated: false,
        revision: (1, 0),
    })
}

/// An application image asking for dio at 40MHz
fn app_image(len: usize) -> Vec<u8> {
    let mut data = vec![0xE9, 1, 0x02, 0x00, 0x00, 0x10, 0x08, 0x40];
    data.resize(len, 0xA5);
    data
}

fn config() -> SessionConfig {
    SessionConfig::new(Firmware::from_bytes("app.bin", app_image(0x6000)))
}

/// Companion files for an ESP32 in a fresh scratch directory
fn esp32_companions(name: &str) -> (std::path::PathBuf, CompanionFiles) {
    let dir = std::env::temp_dir().join(format!(
        "wledflasher-session-{}-{}",
        name,
        std::process::id()
    ));
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("bootloader_dio_40m.bin"), app_image(0x4000)).unwrap();
    fs::write(dir.join("partitions.bin"), vec![0xAA; 0xC00]).unwrap();
    fs::write(dir.join("otadata.bin"), vec![0xFF; 0x2000]).unwrap();

    let companions = CompanionFiles {
        bootloader: Some(
            dir.join("bootloader_$FLASH_MODE$_$FLASH_FREQ$.bin")
                .display()
                .to_string(),
        ),
        partitions: Some(dir.join("partitions.bin")),
        otadata: Some(dir.join("otadata.bin")),
    };

    (dir, companions)
}

fn run(
    device: &Rc<RefCell<Device>>,
    config: &SessionConfig,
) -> (Result<(), Error>, SessionState, Recorder) {
    let mut connector = MockConnector::new(device);
    let mut recorder = Recorder::default();

    let mut session = FlashSession::new(&mut connector, &mut recorder);
    let result = session.run(config);
    let state = session.state().clone();

    (result, state, recorder)
}

#[test]
fn flashes_an_esp8266() {
    let device = Device::new(esp8266_info());

    let (result, state, recorder) = run(&device, &config());

    result.unwrap();
    assert_eq!(state, SessionState::Done);
    assert_eq!(
        recorder.states,
        vec![
            SessionState::PortSelected,
            SessionState::ChipDetected,
            SessionState::InfoRead,
            SessionState::StubRunning,
            SessionState::BaudNegotiated,
            SessionState::FlashSizeKnown,
            SessionState::ParametersConfigured,
            SessionState::Erased,
            SessionState::Written,
            SessionState::Reset,
            SessionState::LoggingStreamed,
            SessionState::Done,
        ]
    );
    assert_eq!(
        recorder.ports,
        vec![SelectedPort::AutoDetected("/dev/ttyUSB0".into())]
    );
    assert_eq!(recorder.infos, vec![esp8266_info()]);
    assert_eq!(recorder.params, vec![("dio".into(), "40MHz".into())]);
    assert_eq!(recorder.segments, vec![(0x0, 2)]);

    let device = device.borrow();
    assert_eq!(
        device.events,
        vec![
            "connect /dev/ttyUSB0",
            "stub",
            "baud 460800",
            "detect 460800",
            "params 4MB",
            "erase",
            "write 0x0",
            "reset",
            "logs 115200",
        ]
    );

    // the header carries the detected flash size, the rest is the image
    let written = &device.flash[&0];
    assert_eq!(&written[..4], &[0xE9, 1, 0x02, 0x40]);
    assert_eq!(&written[4..], &app_image(0x6000)[4..]);
    assert!(!device.port_open);
}

#[test]
fn logs_are_streamed_after_reset() {
    let device = Device::new(esp8266_info());

    let (result, _, recorder) = run(&device, &config());

    result.unwrap();
    assert_eq!(recorder.lines.len(), 2);
    let boot = &recorder.lines[1];
    assert!(boot.ends_with("] ESP32 boot"), "{boot}");
    assert_eq!(boot.matches('[').count(), 1);
}

#[test]
fn rejected_baud_rate_falls_back_to_115200() {
    let device = Device::new(esp8266_info());
    device.borrow_mut().max_baud = 230_400;

    let (result, state, recorder) = run(&device, &config());

    result.unwrap();
    assert_eq!(state, SessionState::Done);
    assert_eq!(recorder.fallbacks, vec![(460_800, 115_200)]);
    assert!(!recorder.states.contains(&SessionState::BaudNegotiated));

    let device = device.borrow();
    assert_eq!(
        device.events[..7],
        [
            "connect /dev/ttyUSB0",
            "stub",
            "baud 460800",
            "detect 460800",
            "connect /dev/ttyUSB0",
            "stub",
            "detect 115200",
        ]
    );
    assert_eq!(device.baud, 115_200);
    assert!(device.flash.contains_key(&0));
}

#[test]
fn fallback_continues_at_the_configured_rate() {
    let device = Device::new(esp8266_info());
    device.borrow_mut().max_baud = 230_400;
    let config = SessionConfig {
        baud_fallback: BaudFallback {
            max_attempts: 1,
            fallback_baud: 230_400,
        },
        ..config()
    };

    let (result, state, recorder) = run(&device, &config);

    result.unwrap();
    assert_eq!(state, SessionState::Done);
    assert_eq!(recorder.fallbacks, vec![(460_800, 230_400)]);

    let device = device.borrow();
    assert_eq!(
        device.events[..9],
        [
            "connect /dev/ttyUSB0",
            "stub",
            "baud 460800",
            "detect 460800",
            "connect /dev/ttyUSB0",
            "stub",
            "baud 230400",
            "detect 230400",
            "params 4MB",
        ]
    );
}

#[test]
fn rom_baud_rate_is_not_negotiated() {
    let device = Device::new(esp8266_info());
    let config = SessionConfig {
        upload_baud: 115_200,
        ..config()
    };

    let (result, _, recorder) = run(&device, &config);

    result.unwrap();
    assert!(!recorder.states.contains(&SessionState::BaudNegotiated));
    assert!(!device
        .borrow()
        .events
        .iter()
        .any(|event| event.starts_with("baud")));
}

#[test]
fn closed_port_is_not_retried() {
    let device = Device::new(esp8266_info());
    device.borrow_mut().unplug_on_baud_change = true;

    let (result, state, recorder) = run(&device, &config());

    let err = result.unwrap_err();
    assert!(err.is_port_closed());
    assert!(matches!(state, SessionState::Failed(_)));
    assert!(recorder.fallbacks.is_empty());
    assert_eq!(
        device
            .borrow()
            .events
            .iter()
            .filter(|event| event.starts_with("connect"))
            .count(),
        1
    );
    assert!(!device.borrow().port_open);
}

#[test]
fn no_erase_skips_the_erase() {
    let device = Device::new(esp8266_info());
    let config = SessionConfig {
        erase: false,
        ..config()
    };

    let (result, _, recorder) = run(&device, &config);

    result.unwrap();
    assert!(!recorder.states.contains(&SessionState::Erased));
    assert!(!device.borrow().events.contains(&"erase".to_string()));
}

#[test]
fn failed_write_reports_the_offset_and_a_full_rerun_recovers() {
    let device = Device::new(esp8266_info());
    device.borrow_mut().fail_write_at = Some(0x0);

    let (result, state, recorder) = run(&device, &config());

    match result {
        Err(Error::Write { offset, .. }) => assert_eq!(offset, 0x0),
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(matches!(&state, SessionState::Failed(reason) if reason.contains("0x0")));
    assert_eq!(recorder.states.last(), Some(&state));
    assert!(!recorder.states.contains(&SessionState::Written));
    // partially written, and left that way
    assert_eq!(device.borrow().flash[&0].len(), 0x3000);
    assert!(!device.borrow().port_open);

    let (result, state, _) = run(&device, &config());

    result.unwrap();
    assert_eq!(state, SessionState::Done);
    let device = device.borrow();
    assert_eq!(device.flash[&0].len(), 0x6000);
    assert_eq!(
        device.events.iter().filter(|event| *event == "erase").count(),
        2
    );
}

#[test]
fn esp32_segments_are_placed_at_their_offsets() {
    let (dir, companions) = esp32_companions("offsets");

    let device = Device::new(esp32_info());
    let config = SessionConfig {
        chip: Some(Chip::Esp32),
        companions,
        ..config()
    };

    let (result, _, recorder) = run(&device, &config);

    fs::remove_dir_all(&dir).ok();
    result.unwrap();
    let offsets = recorder.segments.iter().map(|(addr, _)| *addr).collect::<Vec<_>>();
    assert_eq!(offsets, vec![0x1000, 0x8000, 0xE000, 0x10000]);

    let device = device.borrow();
    // ESP32 size code for 4MB in the bootloader header
    assert_eq!(device.flash[&0x1000][3], 0x20);
    assert_eq!(device.flash[&0x10000], app_image(0x6000));
}

#[test]
fn oversized_layout_fails_before_anything_is_written() {
    let device = Device::new(esp8266_info());
    device.borrow_mut().flash_size = FlashSize::_256Kb;
    let config = SessionConfig::new(Firmware::from_bytes("big.bin", app_image(0x80000)));

    let (result, _, recorder) = run(&device, &config);

    assert!(matches!(result, Err(Error::Write { offset: 0, .. })));
    assert!(recorder.segments.is_empty());
    let device = device.borrow();
    assert!(device.flash.is_empty());
    assert!(!device.events.contains(&"erase".to_string()));
}

#[test]
fn unsupported_chip_never_reports_chip_info() {
    struct Unsupported;

    impl Connector for Unsupported {
        type Client = MockClient;

        fn available_ports(&self) -> Result<Vec<PortCandidate>, Error> {
            Ok(vec![PortCandidate::new("COM3", None)])
        }

        fn connect(&mut self, _port: &str, _chip: Option<Chip>) -> Result<MockClient, Error> {
            Err(Error::UnsupportedChip(0x0000_07c6))
        }

        fn open_monitor(&mut self, _port: &str, _baud: u32) -> Result<Box<dyn Read + Send>, Error> {
            unreachable!()
        }
    }

    let mut recorder = Recorder::default();
    let mut connector = Unsupported;
    let mut session = FlashSession::new(&mut connector, &mut recorder);

    let result = session.run(&config());
    let state = session.state().clone();

    assert!(matches!(result, Err(Error::UnsupportedChip(0x0000_07c6))));
    assert!(matches!(state, SessionState::Failed(_)));
    assert!(recorder.infos.is_empty());
    assert_eq!(recorder.states[0], SessionState::PortSelected);
    assert_eq!(recorder.states.len(), 2);
}

#[test]
fn port_selection_needs_exactly_one_candidate() {
    let device = Device::new(esp8266_info());

    let mut none = MockConnector::new(&device);
    none.ports.clear();
    let mut recorder = Recorder::default();
    let result = FlashSession::new(&mut none, &mut recorder).run(&config());
    assert!(matches!(result, Err(Error::NoSerial)));

    let mut two = MockConnector::new(&device);
    two.ports.push(PortCandidate::new("/dev/ttyUSB1", None));
    let mut recorder = Recorder::default();
    match FlashSession::new(&mut two, &mut recorder).run(&config()) {
        Err(Error::MultipleSerialPorts(ports)) => assert_eq!(
            ports,
            vec![
                "/dev/ttyUSB0 (CP2102 USB to UART)".to_string(),
                "/dev/ttyUSB1 (n/a)".to_string()
            ]
        ),
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(device.borrow().events.is_empty());

    let config = SessionConfig {
        port: Some("/dev/ttyACM0".into()),
        ..config()
    };
    let mut recorder = Recorder::default();
    FlashSession::new(&mut two, &mut recorder)
        .run(&config)
        .unwrap();
    assert_eq!(
        recorder.ports,
        vec![SelectedPort::Requested("/dev/ttyACM0".into())]
    );
}

#[test]
fn cancellation_stops_between_steps() {
    let device = Device::new(esp8266_info());
    let cancel = Arc::new(AtomicBool::new(false));

    struct CancelAfterInfo {
        inner: Recorder,
        cancel: Arc<AtomicBool>,
    }

    impl Observer for CancelAfterInfo {
        fn state_changed(&mut self, state: &SessionState) {
            if *state == SessionState::InfoRead {
                self.cancel.store(true, Ordering::SeqCst);
            }
            self.inner.state_changed(state);
        }
    }

    let mut observer = CancelAfterInfo {
        inner: Recorder::default(),
        cancel: cancel.clone(),
    };
    let mut connector = MockConnector::new(&device);
    let result = FlashSession::new(&mut connector, &mut observer)
        .with_cancel(cancel)
        .run(&config());

    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(
        observer.inner.states.last(),
        Some(&SessionState::Failed(Error::Cancelled.to_string()))
    );
    assert!(!device.borrow().events.contains(&"stub".to_string()));
    assert!(!device.borrow().port_open);
}

#[test]
fn show_logs_only_opens_a_monitor() {
    let device = Device::new(esp8266_info());
    let mut connector = MockConnector::new(&device);
    let mut recorder = Recorder::default();

    run_monitor(
        &mut connector,
        None,
        115_200,
        &mut recorder,
        Arc::new(AtomicBool::new(false)),
    )
    .unwrap();

    assert_eq!(device.borrow().events, vec!["monitor /dev/ttyUSB0 115200"]);
    assert_eq!(
        recorder.states,
        vec![
            SessionState::PortSelected,
            SessionState::LoggingStreamed,
            SessionState::Done
        ]
    );
    assert_eq!(recorder.lines.len(), 2);
}

#[test]
fn cancellation_stops_a_write_between_segments() {
    struct CancelOnFirstSegment {
        inner: Recorder,
        cancel: Arc<AtomicBool>,
    }

    impl Observer for CancelOnFirstSegment {
        fn state_changed(&mut self, state: &SessionState) {
            self.inner.state_changed(state);
        }

        fn segment_started(&mut self, addr: u32, blocks: usize) {
            self.cancel.store(true, Ordering::SeqCst);
            self.inner.segment_started(addr, blocks);
        }
    }

    let (dir, companions) = esp32_companions("cancel");
    let device = Device::new(esp32_info());
    let config = SessionConfig {
        chip: Some(Chip::Esp32),
        companions,
        ..config()
    };
    let cancel = Arc::new(AtomicBool::new(false));
    let mut observer = CancelOnFirstSegment {
        inner: Recorder::default(),
        cancel: cancel.clone(),
    };

    let mut connector = MockConnector::new(&device);
    let result = FlashSession::new(&mut connector, &mut observer)
        .with_cancel(cancel)
        .run(&config);

    fs::remove_dir_all(&dir).ok();
    assert!(matches!(result, Err(Error::Cancelled)), "{result:?}");
    assert_eq!(observer.inner.segments, vec![(0x1000, 1)]);
    assert!(!observer.inner.states.contains(&SessionState::Written));
    assert_eq!(
        observer.inner.states.last(),
        Some(&SessionState::Failed(Error::Cancelled.to_string()))
    );

    let device = device.borrow();
    assert_eq!(device.flash.keys().copied().collect::<Vec<_>>(), vec![0x1000]);
    assert!(!device.events.contains(&"reset".to_string()));
    assert!(!device.port_open);
}

#[test]
fn missing_companions_fail_before_connecting_to_a_forced_esp32() {
    let device = Device::new(esp32_info());
    let config = SessionConfig {
        chip: Some(Chip::Esp32),
        ..config()
    };

    let (result, state, recorder) = run(&device, &config);

    assert!(matches!(result, Err(Error::CompanionFileMissing("bootloader"))));
    assert!(matches!(state, SessionState::Failed(_)));
    assert!(recorder.ports.is_empty());
    assert!(device.borrow().events.is_empty());
}
