// -----------------------------------------------------------------------------
// ADR magnet cycle control
//
// This program is free software; you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation; either version 2 of the License, or (at your option) any later
// version.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// this program; if not, write to the Free Software Foundation, Inc.,
// 59 Temple Place, Suite 330, Boston, MA  02111-1307  USA
//
// -----------------------------------------------------------------------------
//
//! A generic communicator thread for line-oriented instruments.
//!
//! A background thread keeps reading from the device into a shared buffer
//! and reconnects when the connection drops; clients write command lines and
//! wait for reply lines with a per-command timeout.

use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use log::*;
use memchr::memchr;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serialport::SerialPort;

use adrctl_core::prelude::{DeviceInfo, Error, Result};

const EOL: u8 = b'\n';

pub type Connector<R, W> = Box<dyn FnMut() -> Result<(R, W)> + Send + 'static>;

struct CommShared<W> {
    writer: Mutex<W>,
    buffer: Mutex<Vec<u8>>,
    seen_eol: Condvar,
    connected: AtomicBool,
    stop: AtomicBool,
}

pub struct CommThread<R, W> {
    connect: Connector<R, W>,
    reader: R,
    shared: Arc<CommShared<W>>,
}

pub struct CommClient<W> {
    shared: Arc<CommShared<W>>,
    timeout: Duration,
}

impl<W: Write> CommClient<W> {
    fn write_line(&self, writer: &mut W, line: &str) -> Result<()> {
        writer.write_all(line.as_bytes())?;
        writer.write_all(&[EOL])?;
        writer.flush()?;
        Ok(())
    }

    /// Send one command line; no reply is expected.
    pub fn send(&self, line: &str) -> Result<()> {
        if !self.shared.connected.load(Ordering::Relaxed) {
            return Err(Error::io("instrument is not connected"));
        }
        let mut writer = self.shared.writer.lock();
        self.write_line(&mut writer, line)
    }

    /// Send a query line and wait for one reply line, trimmed.
    pub fn communicate(&self, line: &str) -> Result<String> {
        if !self.shared.connected.load(Ordering::Relaxed) {
            return Err(Error::io("instrument is not connected"));
        }
        let mut buffer = self.shared.buffer.lock();
        buffer.clear();
        {
            let mut writer = self.shared.writer.lock();
            self.write_line(&mut writer, line)?;
        }
        self.wait_eol(&mut buffer)?;
        let pos = memchr(EOL, &buffer[..]).expect("eol was signalled");
        let reply: Vec<u8> = buffer.drain(..=pos).take(pos).collect();
        String::from_utf8(reply)
            .map(|s| s.trim().to_string())
            .map_err(|_| Error::protocol(format!("reply to {:?} is not text", line)))
    }

    fn wait_eol(&self, buffer: &mut MutexGuard<Vec<u8>>) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        while memchr(EOL, &buffer[..]).is_none() {
            if self.shared.seen_eol.wait_until(buffer, deadline).timed_out() {
                return Err(Error::io("no response from the instrument"));
            }
        }
        Ok(())
    }
}

impl<W> Drop for CommClient<W> {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
    }
}

impl<R: Read + Send + 'static, W: Write + Send + 'static> CommThread<R, W> {
    /// Make the first connection and start the reader thread.
    pub fn spawn(mut connect: Connector<R, W>, timeout: Duration, name: &str)
                 -> Result<CommClient<W>> {
        let (reader, writer) = connect()?;
        let shared = Arc::new(CommShared {
            writer: Mutex::new(writer),
            buffer: Mutex::new(Vec::with_capacity(2048)),
            seen_eol: Condvar::new(),
            connected: AtomicBool::new(true),
            stop: AtomicBool::new(false),
        });
        let mut comm = CommThread {
            connect,
            reader,
            shared: Arc::clone(&shared),
        };
        let prefix = format!("[{}] ", name);
        thread::spawn(move || {
            mlzlog::set_thread_prefix(prefix);
            comm.thread();
        });
        Ok(CommClient { shared, timeout })
    }

    fn stopped(&self) -> bool {
        self.shared.stop.load(Ordering::Relaxed)
    }

    fn thread(&mut self) {
        debug!("reader thread started");
        let mut buf = [0; 256];
        while !self.stopped() {
            while !self.stopped() {
                match self.reader.read(&mut buf) {
                    Ok(0) => {
                        warn!("connection closed by the device");
                        break;
                    }
                    Ok(n) => {
                        let mut buffer = self.shared.buffer.lock();
                        buffer.extend(&buf[..n]);
                        if memchr(EOL, &buffer[..]).is_some() {
                            self.shared.seen_eol.notify_one();
                        }
                    }
                    // read timeouts just mean the device has nothing to say
                    Err(e) if matches!(e.kind(), ErrorKind::TimedOut |
                                                 ErrorKind::WouldBlock |
                                                 ErrorKind::Interrupted) => {}
                    Err(e) => {
                        warn!("read error: {}", e);
                        break;
                    }
                }
            }
            self.shared.connected.store(false, Ordering::SeqCst);
            while !self.stopped() {
                match (self.connect)() {
                    Ok((reader, writer)) => {
                        info!("reconnected");
                        self.reader = reader;
                        *self.shared.writer.lock() = writer;
                        self.shared.connected.store(true, Ordering::SeqCst);
                        break;
                    }
                    Err(e) => {
                        warn!("error during reconnect: {}", e);
                        thread::sleep(Duration::from_millis(500));
                    }
                }
            }
        }
        debug!("reader thread exited");
    }
}


/// Client over a serial port, with a shared handle for the reader side.
pub type SerialClient = CommClient<Box<dyn SerialPort>>;

pub fn serial_client(port: &str, baudrate: u32, timeout: Duration, name: &str)
                     -> Result<SerialClient> {
    let port_name = port.to_string();
    let connect: Connector<Box<dyn SerialPort>, Box<dyn SerialPort>> =
        Box::new(move || {
            let port = serialport::new(&port_name, baudrate)
                .timeout(Duration::from_millis(100))
                .open()
                .map_err(|e| Error::io(format!("cannot open {}: {}", port_name, e)))?;
            let reader = port.try_clone().map_err(|e| Error::io(e.to_string()))?;
            Ok((reader, port))
        });
    CommThread::spawn(connect, timeout, name)
}


/// Parse an SRS `*IDN?` reply and check it comes from the expected model.
pub fn parse_idn(reply: &str, model: &str) -> Result<DeviceInfo> {
    let parts: Vec<&str> = reply.split(',').collect();
    match parts[..] {
        [vendor, device, serial, firmware]
            if vendor == "Stanford_Research_Systems" && device == model =>
            Ok(DeviceInfo::new(device.into(), firmware.trim().into(),
                               serial.trim().into())),
        _ => Err(Error::protocol(format!("unsupported device (idn reply {:?})", reply))),
    }
}
