//! Decide what gets written where
//!
//! The flash mode and frequency come from the application image's header, the
//! size from the flash chip itself. On an ESP32 the application is preceded by
//! a second-stage bootloader, a partition table and the OTA data partition,
//! each at a fixed offset.

use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
};

use log::debug;

use crate::{
    error::Error,
    flasher::{FlashFrequency, FlashMode, FlashSize},
    image_format::{patch_boot_header, ImageHeader, Segment},
    release::{Asset, ReleaseSource},
    targets::{Chip, ChipInfo},
};

pub const ESP32_BOOTLOADER_OFFSET: u32 = 0x1000;
pub const ESP32_PARTITIONS_OFFSET: u32 = 0x8000;
pub const ESP32_OTADATA_OFFSET: u32 = 0xE000;
pub const ESP32_APP_OFFSET: u32 = 0x10000;
pub const ESP8266_APP_OFFSET: u32 = 0x0;

const FLASH_MODE_PLACEHOLDER: &str = "$FLASH_MODE$";
const FLASH_FREQ_PLACEHOLDER: &str = "$FLASH_FREQ$";

/// Largest flash an ESP32 can map, no image can be bigger
const MAX_IMAGE_SIZE: usize = 16 * 1024 * 1024;

/// An application image to flash
#[derive(Clone, PartialEq, Eq)]
pub struct Firmware {
    name: String,
    data: Vec<u8>,
}

impl Firmware {
    pub fn from_path(path: &Path) -> Result<Self, Error> {
        let data =
            fs::read(path).map_err(|e| Error::FileOpenError(path.display().to_string(), e))?;

        Ok(Self::from_bytes(path.display().to_string(), data))
    }

    pub fn from_bytes(name: impl Into<String>, data: Vec<u8>) -> Self {
        Firmware {
            name: name.into(),
            data,
        }
    }

    /// Download a release asset into memory
    pub fn from_release(source: &dyn ReleaseSource, asset: &Asset) -> Result<Self, Error> {
        let download = |e| Error::Download {
            asset: asset.name.clone(),
            source: e,
        };

        let mut data = Vec::with_capacity((asset.size as usize).min(MAX_IMAGE_SIZE));
        source
            .download_asset(asset)?
            .read_to_end(&mut data)
            .map_err(download)?;

        Ok(Self::from_bytes(asset.name.clone(), data))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn header(&self) -> Result<ImageHeader, Error> {
        ImageHeader::parse(&self.data)
    }
}

impl std::fmt::Debug for Firmware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Firmware")
            .field("name", &self.name)
            .field("size", &self.data.len())
            .finish()
    }
}

/// The files an ESP32 needs next to its application
///
/// The bootloader is a path template which may contain `$FLASH_MODE$` and
/// `$FLASH_FREQ$`, e.g. `bootloader_$FLASH_MODE$_$FLASH_FREQ$.bin`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompanionFiles {
    pub bootloader: Option<String>,
    pub partitions: Option<PathBuf>,
    pub otadata: Option<PathBuf>,
}

/// Everything needed to configure the flash and write it
#[derive(Debug, Clone)]
pub struct FlashParameters {
    pub chip: Chip,
    pub mode: FlashMode,
    pub frequency: FlashFrequency,
    pub size: FlashSize,
    /// Sorted by address
    pub segments: Vec<Segment<'static>>,
}

impl FlashParameters {
    /// Number of bytes that will be written
    pub fn total_size(&self) -> u64 {
        self.segments.iter().map(|s| s.size() as u64).sum()
    }
}

/// Check everything that can be checked before a device is connected
///
/// The image header is always checked. The ESP32 companion files are only
/// checked when the chip family is already known.
pub fn check_inputs(
    chip: Option<Chip>,
    firmware: &Firmware,
    companions: &CompanionFiles,
) -> Result<(), Error> {
    let (mode, frequency) = flash_settings(firmware)?;

    if chip == Some(Chip::Esp32) {
        let paths = Esp32Companions::resolve(companions, mode, frequency)?;
        for path in [paths.bootloader.as_path(), paths.partitions, paths.otadata] {
            fs::metadata(path)
                .map_err(|e| Error::FileOpenError(path.display().to_string(), e))?;
        }
    }

    Ok(())
}

/// Work out the flash settings and the layout of the data to write
pub fn configure_flash_parameters(
    info: &ChipInfo,
    size: FlashSize,
    firmware: &Firmware,
    companions: &CompanionFiles,
) -> Result<FlashParameters, Error> {
    let (mode, frequency) = flash_settings(firmware)?;

    let segments = match info {
        ChipInfo::Esp8266(_) => {
            let mut app = firmware.data().to_vec();
            patch_boot_header(&mut app, mode, size, frequency, Chip::Esp8266)?;

            vec![Segment::new(ESP8266_APP_OFFSET, app)]
        }
        ChipInfo::Esp32(_) => {
            let paths = Esp32Companions::resolve(companions, mode, frequency)?;

            let mut bootloader = read_file(&paths.bootloader)?;
            patch_boot_header(&mut bootloader, mode, size, frequency, Chip::Esp32)?;

            vec![
                Segment::new(ESP32_BOOTLOADER_OFFSET, bootloader),
                Segment::new(ESP32_PARTITIONS_OFFSET, read_file(paths.partitions)?),
                Segment::new(ESP32_OTADATA_OFFSET, read_file(paths.otadata)?),
                Segment::new(ESP32_APP_OFFSET, firmware.data().to_vec()),
            ]
        }
    };

    validate_layout(&segments, size)?;

    Ok(FlashParameters {
        chip: info.chip(),
        mode,
        frequency,
        size,
        segments,
    })
}

/// Flash mode and frequency to write the image with
fn flash_settings(firmware: &Firmware) -> Result<(FlashMode, FlashFrequency), Error> {
    let header = firmware.header()?;
    let frequency = header.flash_frequency()?;
    let mode = match header.flash_mode()? {
        // the bootloader switches to quad mode itself if the image asks for it
        FlashMode::Qio | FlashMode::Qout => FlashMode::Dio,
        mode => mode,
    };

    Ok((mode, frequency))
}

/// Concrete paths of the files written next to an ESP32 application
struct Esp32Companions<'a> {
    bootloader: PathBuf,
    partitions: &'a Path,
    otadata: &'a Path,
}

impl<'a> Esp32Companions<'a> {
    fn resolve(
        companions: &'a CompanionFiles,
        mode: FlashMode,
        frequency: FlashFrequency,
    ) -> Result<Self, Error> {
        if matches!(frequency, FlashFrequency::_20Mhz | FlashFrequency::_26Mhz) {
            return Err(Error::BootloaderUnavailable { frequency });
        }

        let template = companions
            .bootloader
            .as_deref()
            .ok_or(Error::CompanionFileMissing("bootloader"))?;

        Ok(Esp32Companions {
            bootloader: resolve_bootloader_template(template, mode, frequency),
            partitions: companions
                .partitions
                .as_deref()
                .ok_or(Error::CompanionFileMissing("partitions"))?,
            otadata: companions
                .otadata
                .as_deref()
                .ok_or(Error::CompanionFileMissing("otadata"))?,
        })
    }
}

/// Substitute the flash mode and frequency into a bootloader path template
pub fn resolve_bootloader_template(
    template: &str,
    mode: FlashMode,
    frequency: FlashFrequency,
) -> PathBuf {
    let path = template
        .replace(FLASH_MODE_PLACEHOLDER, &mode.to_string())
        .replace(FLASH_FREQ_PLACEHOLDER, frequency.file_suffix());
    debug!("Resolved bootloader template '{}' to '{}'", template, path);

    PathBuf::from(path)
}

/// Check that segments are sorted, disjoint and inside the flash
///
/// A violation is reported as a write failure at the offending segment's
/// offset, before anything is written there.
pub fn validate_layout(segments: &[Segment<'_>], size: FlashSize) -> Result<(), Error> {
    let mut previous: Option<&Segment<'_>> = None;

    for segment in segments {
        if let Some(previous) = previous {
            if (segment.addr as u64) < previous.end() {
                return Err(Error::write_at(
                    segment.addr,
                    Error::SegmentOverlap {
                        offset: segment.addr,
                        previous: previous.addr,
                    },
                ));
            }
        }

        if segment.end() > size.size() as u64 {
            return Err(Error::write_at(
                segment.addr,
                Error::SegmentOutOfBounds {
                    offset: segment.addr,
                    end: segment.end().min(u32::MAX as u64) as u32,
                    flash_size: size,
                },
            ));
        }

        previous = Some(segment);
    }

    Ok(())
}

fn read_file(path: &Path) -> Result<Vec<u8>, Error> {
    fs::read(path)
        .map_err(|e| Error::FileOpenError(path.display().to_string(), e))
}

#[cfg(test)]
mod tests {
    use std::{io, path::PathBuf};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::targets::{Esp32Info, Esp8266Info};

    fn app_image(mode: u8, config: u8, len: usize) -> Vec<u8> {
        let mut data = vec![0xE9, 1, mode, config, 0x00, 0x10, 0x08, 0x40];
        data.resize(len, 0x5A);
        data
    }

    fn esp8266() -> ChipInfo {
        ChipInfo::Esp8266(Esp8266Info {
            model: "ESP8266EX".into(),
            chip_id: 0x0012_3456,
            mac: "18:FE:34:12:34:56".into(),
        })
    }

    fn esp32() -> ChipInfo {
        ChipInfo::Esp32(Esp32Info {
            model: "ESP32-D0WDQ6".into(),
            mac: "24:0A:C4:01:02:03".into(),
            cores: 2,
            cpu_frequency: 240,
            bluetooth: true,
            embedded_flash: false,
            adc_calibrated: true,
            revision: (1, 0),
        })
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "wledflasher-flash-data-{}-{}",
            name,
            std::process::id()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn esp8266_writes_the_patched_app_at_zero() {
        let firmware = Firmware::from_bytes("app.bin", app_image(0x03, 0x00, 0x2000));
        let params = configure_flash_parameters(
            &esp8266(),
            FlashSize::_4Mb,
            &firmware,
            &CompanionFiles::default(),
        )
        .unwrap();

        assert_eq!(params.mode, FlashMode::Dout);
        assert_eq!(params.frequency, FlashFrequency::_40Mhz);
        assert_eq!(params.segments.len(), 1);
        assert_eq!(params.segments[0].addr, 0);
        assert_eq!(&params.segments[0].data[2..4], &[0x03, 0x40]);
        assert_eq!(params.total_size(), 0x2000);
    }

    #[test]
    fn quad_modes_are_written_as_dio() {
        let firmware = Firmware::from_bytes("app.bin", app_image(0x00, 0x0F, 64));
        let params = configure_flash_parameters(
            &esp8266(),
            FlashSize::_1Mb,
            &firmware,
            &CompanionFiles::default(),
        )
        .unwrap();

        assert_eq!(params.mode, FlashMode::Dio);
        assert_eq!(params.frequency, FlashFrequency::_80Mhz);
    }

    #[test]
    fn esp32_layout_uses_companion_files() {
        let dir = scratch_dir("esp32");
        fs::write(dir.join("bootloader_dio_40m.bin"), app_image(0x00, 0x00, 0x1000)).unwrap();
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
        let firmware = Firmware::from_bytes("app.bin", app_image(0x02, 0x00, 0x4000));

        let params =
            configure_flash_parameters(&esp32(), FlashSize::_4Mb, &firmware, &companions).unwrap();

        let offsets = params.segments.iter().map(|s| s.addr).collect::<Vec<_>>();
        assert_eq!(offsets, vec![0x1000, 0x8000, 0xE000, 0x10000]);
        // bootloader header carries the detected size, the app is untouched
        assert_eq!(&params.segments[0].data[2..4], &[0x02, 0x20]);
        assert_eq!(&params.segments[3].data[..], firmware.data());

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn esp32_rejects_slow_flash() {
        let firmware = Firmware::from_bytes("app.bin", app_image(0x02, 0x01, 64));
        let companions = CompanionFiles {
            bootloader: Some("bootloader.bin".into()),
            ..CompanionFiles::default()
        };

        assert!(matches!(
            configure_flash_parameters(&esp32(), FlashSize::_4Mb, &firmware, &companions),
            Err(Error::BootloaderUnavailable {
                frequency: FlashFrequency::_26Mhz
            })
        ));
    }

    #[test]
    fn esp32_needs_a_bootloader() {
        let firmware = Firmware::from_bytes("app.bin", app_image(0x02, 0x00, 64));

        assert!(matches!(
            configure_flash_parameters(
                &esp32(),
                FlashSize::_4Mb,
                &firmware,
                &CompanionFiles::default()
            ),
            Err(Error::CompanionFileMissing("bootloader"))
        ));
    }

    #[test]
    fn missing_bootloader_file_is_reported() {
        let firmware = Firmware::from_bytes("app.bin", app_image(0x02, 0x0F, 64));
        let companions = CompanionFiles {
            bootloader: Some("/nonexistent/bootloader_$FLASH_MODE$_$FLASH_FREQ$.bin".into()),
            partitions: Some("/nonexistent/partitions.bin".into()),
            otadata: Some("/nonexistent/otadata.bin".into()),
        };

        match configure_flash_parameters(&esp32(), FlashSize::_4Mb, &firmware, &companions) {
            Err(Error::FileOpenError(path, _)) => {
                assert_eq!(path, "/nonexistent/bootloader_dio_80m.bin")
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn invalid_images_are_rejected() {
        let firmware = Firmware::from_bytes("notes.txt", b"hello world".to_vec());

        assert!(matches!(
            configure_flash_parameters(
                &esp8266(),
                FlashSize::_4Mb,
                &firmware,
                &CompanionFiles::default()
            ),
            Err(Error::InvalidImage(_))
        ));
    }

    #[test]
    fn bootloader_template_placeholders() {
        assert_eq!(
            resolve_bootloader_template(
                "bootloader_$FLASH_MODE$_$FLASH_FREQ$.bin",
                FlashMode::Dout,
                FlashFrequency::_80Mhz
            ),
            PathBuf::from("bootloader_dout_80m.bin")
        );
        assert_eq!(
            resolve_bootloader_template("bootloader.bin", FlashMode::Dio, FlashFrequency::_40Mhz),
            PathBuf::from("bootloader.bin")
        );
    }

    #[test]
    fn overlapping_segments_fail_at_the_later_offset() {
        let segments = [
            Segment::new(0x1000, vec![0; 0x8000]),
            Segment::new(0x8000, vec![0; 0x100]),
        ];

        match validate_layout(&segments, FlashSize::_4Mb) {
            Err(Error::Write { offset, source }) => {
                assert_eq!(offset, 0x8000);
                assert!(matches!(
                    *source,
                    Error::SegmentOverlap {
                        offset: 0x8000,
                        previous: 0x1000
                    }
                ));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn segments_must_fit_in_flash() {
        let segments = [
            Segment::new(0x0, vec![0; 0x1000]),
            Segment::new(0x10000, vec![0; 0x100000]),
        ];

        assert!(validate_layout(&segments, FlashSize::_2Mb).is_ok());
        assert!(matches!(
            validate_layout(&segments, FlashSize::_1Mb),
            Err(Error::Write {
                offset: 0x10000,
                ..
            })
        ));
    }

    struct OneAsset(Vec<u8>);

    impl ReleaseSource for OneAsset {
        fn list_releases(&self) -> Result<Vec<crate::release::Release>, Error> {
            Ok(Vec::new())
        }

        fn download_asset(&self, _asset: &Asset) -> Result<Box<dyn Read>, Error> {
            Ok(Box::new(io::Cursor::new(self.0.clone())))
        }
    }

    #[test]
    fn firmware_from_a_release_asset() {
        let asset = Asset {
            name: "WLED_0.14.0_ESP8266.bin".into(),
            download_url: "https://example.invalid/WLED_0.14.0_ESP8266.bin".into(),
            size: 64,
        };
        let firmware = Firmware::from_release(&OneAsset(app_image(2, 0, 64)), &asset).unwrap();

        assert_eq!(firmware.name(), "WLED_0.14.0_ESP8266.bin");
        assert_eq!(firmware.data().len(), 64);
    }

    #[test]
    fn asset_size_is_only_a_hint() {
        let asset = Asset {
            name: "WLED_0.14.0_ESP32.bin".into(),
            download_url: "https://example.invalid/WLED_0.14.0_ESP32.bin".into(),
            size: u64::MAX,
        };
        let firmware = Firmware::from_release(&OneAsset(app_image(2, 0, 128)), &asset).unwrap();

        assert_eq!(firmware.data().len(), 128);
    }

    #[test]
    fn inputs_are_checked_without_a_device() {
        let firmware = Firmware::from_bytes("app.bin", app_image(0x02, 0x00, 64));

        assert!(check_inputs(None, &firmware, &CompanionFiles::default()).is_ok());
        assert!(check_inputs(Some(Chip::Esp8266), &firmware, &CompanionFiles::default()).is_ok());
        assert!(matches!(
            check_inputs(Some(Chip::Esp32), &firmware, &CompanionFiles::default()),
            Err(Error::CompanionFileMissing("bootloader"))
        ));

        let text = Firmware::from_bytes("notes.txt", b"hello world".to_vec());
        assert!(matches!(
            check_inputs(None, &text, &CompanionFiles::default()),
            Err(Error::InvalidImage(_))
        ));
    }

    #[test]
    fn forced_esp32_needs_existing_companions() {
        let dir = scratch_dir("check");
        fs::write(dir.join("bootloader_dio_40m.bin"), app_image(0x02, 0x00, 0x1000)).unwrap();
        fs::write(dir.join("partitions.bin"), vec![0xAA; 0xC00]).unwrap();
        let firmware = Firmware::from_bytes("app.bin", app_image(0x02, 0x00, 64));
        let mut companions = CompanionFiles {
            bootloader: Some(
                dir.join("bootloader_$FLASH_MODE$_$FLASH_FREQ$.bin")
                    .display()
                    .to_string(),
            ),
            partitions: Some(dir.join("partitions.bin")),
            otadata: Some(dir.join("otadata.bin")),
        };

        match check_inputs(Some(Chip::Esp32), &firmware, &companions) {
            Err(Error::FileOpenError(path, _)) => assert!(path.ends_with("otadata.bin")),
            other => panic!("unexpected result: {other:?}"),
        }

        fs::write(dir.join("otadata.bin"), vec![0xFF; 0x2000]).unwrap();
        assert!(check_inputs(Some(Chip::Esp32), &firmware, &companions).is_ok());

        companions.partitions = None;
        assert!(matches!(
            check_inputs(Some(Chip::Esp32), &firmware, &companions),
            Err(Error::CompanionFileMissing("partitions"))
        ));

        fs::remove_dir_all(dir).ok();
    }
}
