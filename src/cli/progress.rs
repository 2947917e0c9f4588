//! Terminal output of a flashing session

use crossterm::style::Stylize;
use indicatif::{ProgressBar, ProgressStyle};

use crate::{
    flash_data::FlashParameters,
    flasher::FlashSize,
    serial::SelectedPort,
    session::{Observer, SessionState},
    targets::ChipInfo,
};

/// Prints a session's progress the way an operator wants to read it
#[derive(Default)]
pub struct ConsoleObserver {
    pb: Option<ProgressBar>,
}

impl ConsoleObserver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Observer for ConsoleObserver {
    fn state_changed(&mut self, state: &SessionState) {
        match state {
            SessionState::Reset => {
                println!("{}", "Done! Flashing is complete!".green());
                println!();
            }
            SessionState::LoggingStreamed => println!("Serial port closed!"),
            _ => {}
        }
    }

    fn port_selected(&mut self, port: &SelectedPort) {
        println!("{port}");
    }

    fn chip_info(&mut self, info: &ChipInfo) {
        println!();
        println!("{info}");
    }

    fn baud_fallback(&mut self, rejected: u32, fallback: u32) {
        println!(
            "{}",
            format!("Chip does not support baud rate {rejected}, changing to {fallback}").yellow()
        );
    }

    fn flash_size(&mut self, size: FlashSize) {
        println!(" - Flash Size: {size}");
    }

    fn flash_parameters(&mut self, params: &FlashParameters) {
        println!(" - Flash Mode: {}", params.mode);
        println!(" - Flash Frequency: {}", params.frequency);
    }

    fn erase_started(&mut self) {
        println!("Erasing flash (this may take a while)...");
    }

    fn segment_started(&mut self, addr: u32, blocks: usize) {
        let style = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40}] {pos:>7}/{len:7} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");

        let pb = ProgressBar::new(blocks as u64)
            .with_message(format!("{addr:#X}"))
            .with_style(style);

        self.pb = Some(pb);
    }

    fn segment_progress(&mut self, block: usize) {
        if let Some(ref pb) = self.pb {
            pb.set_position(block as u64);
        }
    }

    fn segment_finished(&mut self) {
        if let Some(pb) = self.pb.take() {
            pb.finish();
        }
    }

    fn reset_started(&mut self) {
        println!("Hard Resetting...");
    }

    fn log_stream_opened(&mut self) {
        println!("Showing logs:");
    }

    fn log_line(&mut self, line: &str) {
        println!("{line}");
    }
}
