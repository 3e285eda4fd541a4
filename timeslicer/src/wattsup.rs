//! Driver for the WattsUp power meter on a serial tty. The meter streams
//! `#d,...;`-framed lines once external logging is enabled; the watts value
//! is the fourth comma-separated field, in tenths of a watt.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::fs::FileTypeExt;
use std::path::PathBuf;

use log::debug;
use nix::sys::termios::{
    cfmakeraw, cfsetispeed, cfsetospeed, tcflush, tcgetattr, tcsetattr, BaudRate, ControlFlags,
    FlushArg, SetArg,
};

const FRAME_MAX: usize = 256;

pub struct WattsUp {
    device: File,
}

impl WattsUp {
    /// Open `/dev/<name>`, put the line into raw 115200 8N1 mode, and start
    /// the meter's external logging at a one second interval.
    pub fn open(device_name: &str) -> io::Result<WattsUp> {
        let path = PathBuf::from("/dev").join(device_name);
        let meta = std::fs::metadata(&path)?;
        if !meta.file_type().is_char_device() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a character device", path.display()),
            ));
        }

        let mut device = File::options().read(true).write(true).open(&path)?;
        setup_serial(&device)?;

        debug!("starting wattsup external log on {}", path.display());
        device.write_all(b"#L,W,3,E,1,1;")?;
        Ok(WattsUp { device })
    }

    /// Block until a complete frame arrives and parse the watts out of it.
    pub fn read_watts(&mut self) -> io::Result<f64> {
        let mut frame = Vec::with_capacity(FRAME_MAX);
        let mut byte = [0u8; 1];

        // sync to the start-of-frame marker
        loop {
            self.device.read_exact(&mut byte)?;
            if byte[0] == b'#' {
                break;
            }
        }
        frame.push(b'#');
        while frame.len() < FRAME_MAX {
            self.device.read_exact(&mut byte)?;
            if byte[0] == b'\n' {
                break;
            }
            frame.push(byte[0]);
        }

        let text = String::from_utf8_lossy(&frame);
        parse_watts_frame(&text).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unparseable wattsup frame: {text}"),
            )
        })
    }
}

impl Drop for WattsUp {
    fn drop(&mut self) {
        debug!("stopping wattsup external log");
        let _ = self.device.write_all(b"#L,R,0;");
    }
}

fn setup_serial(device: &File) -> io::Result<()> {
    let fd = device.as_fd();
    let mut attrs = tcgetattr(fd)?;
    cfmakeraw(&mut attrs);
    cfsetispeed(&mut attrs, BaudRate::B115200)?;
    cfsetospeed(&mut attrs, BaudRate::B115200)?;
    tcflush(fd, FlushArg::TCIFLUSH)?;
    // 8N1
    attrs.control_flags &= !(ControlFlags::PARENB | ControlFlags::CSTOPB | ControlFlags::CSIZE);
    attrs.control_flags |= ControlFlags::CS8;
    tcsetattr(fd, SetArg::TCSANOW, &attrs)?;
    Ok(())
}

/// The watts field is the fourth comma-separated value; the meter reports
/// tenths of a watt.
pub fn parse_watts_frame(frame: &str) -> Option<f64> {
    let watts_field = frame.split(',').nth(3)?;
    let tenths: f64 = watts_field.trim().trim_end_matches(';').parse().ok()?;
    Some(tenths / 10.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_fourth_field_as_tenths_of_watts() {
        assert_eq!(parse_watts_frame("#d,-,18,925,120,0;"), Some(92.5));
        assert_eq!(parse_watts_frame("#d,-,18,1800,1,2;"), Some(180.0));
    }

    #[test]
    fn short_or_garbled_frames_parse_to_nothing() {
        assert_eq!(parse_watts_frame("#d,-,18"), None);
        assert_eq!(parse_watts_frame("#d,-,18,watts,1;"), None);
        assert_eq!(parse_watts_frame(""), None);
    }

    #[test]
    fn trailing_terminator_is_tolerated() {
        assert_eq!(parse_watts_frame("#d,-,18,310;"), Some(31.0));
    }
}
