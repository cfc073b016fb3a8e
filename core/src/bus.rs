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
//! Client for the pub/sub key-value bus.
//!
//! The bus speaks the Redis wire protocol (RESP): settings live in plain
//! keys, telemetry in time-series keys, and commands arrive over pub/sub
//! channels.  All values round-trip as decimal text.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;
use log::*;
use crossbeam_channel::{unbounded, Receiver};
use parking_lot::Mutex;

use crate::errors::{Error, Result};

/// Timeout for request/reply operations on the bus.
const BUS_TIMEOUT: Duration = Duration::from_secs(5);


/// The operations the controller needs from the key-value bus.
///
/// `set` also publishes the value on the channel named like the key, so a
/// stored setting doubles as a notification to anyone listening.
pub trait Bus: Send + Sync {
    /// Store a value and publish it on the channel of the same name.
    fn set(&self, key: &str, value: &str) -> Result<()>;
    /// Read a plain key.  Absent keys are `None`, not an error.
    fn get(&self, key: &str) -> Result<Option<String>>;
    /// Append a sample to a time-series key, timestamped by the server.
    fn add(&self, key: &str, value: f64) -> Result<()>;
    /// Latest sample of a time-series key, as (millisecond timestamp, value).
    fn latest(&self, key: &str) -> Result<Option<(u64, f64)>>;
    /// Create a time-series key; succeeds if it already exists.
    fn create_ts(&self, key: &str) -> Result<()>;
    /// Subscribe to the given channels.  Messages arrive as (channel, payload)
    /// pairs; a disconnected receiver means the subscription died.
    fn subscribe(&self, channels: &[String]) -> Result<Receiver<(String, String)>>;

    /// Read a key that must be present and numeric.
    fn get_f64(&self, key: &str) -> Result<f64> {
        match self.get(key)? {
            Some(v) => v.trim().parse().map_err(
                |_| Error::parsing(format!("key {} is not numeric: {:?}", key, v))),
            None => Err(Error::config(format!("key {} missing from the bus", key))),
        }
    }
}


/// RESP wire format: encoding of commands and decoding of replies.
mod resp {
    use std::io::{self, BufRead, Read, Write};

    #[derive(Debug, PartialEq)]
    pub enum Value {
        Simple(String),
        Error(String),
        Int(i64),
        Bulk(Option<String>),
        Array(Option<Vec<Value>>),
    }

    fn invalid(msg: String) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, msg)
    }

    /// Encode a command as an array of bulk strings.
    pub fn write_command(w: &mut impl Write, args: &[&str]) -> io::Result<()> {
        let mut buf = Vec::with_capacity(64);
        write!(buf, "*{}\r\n", args.len())?;
        for arg in args {
            write!(buf, "${}\r\n{}\r\n", arg.len(), arg)?;
        }
        w.write_all(&buf)?;
        w.flush()
    }

    /// Decode a single reply (or pushed message).
    pub fn read_value(r: &mut impl BufRead) -> io::Result<Value> {
        let mut line = String::new();
        if r.read_line(&mut line)? == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof,
                                      "bus connection closed"));
        }
        let line = line.trim_end_matches(|ch| ch == '\r' || ch == '\n');
        if line.is_empty() {
            return Err(invalid("empty reply line".into()));
        }
        let (tag, rest) = line.split_at(1);
        match tag {
            "+" => Ok(Value::Simple(rest.into())),
            "-" => Ok(Value::Error(rest.into())),
            ":" => rest.parse().map(Value::Int).map_err(
                |_| invalid(format!("invalid integer reply: {:?}", rest))),
            "$" => {
                let len: i64 = rest.parse().map_err(
                    |_| invalid(format!("invalid bulk length: {:?}", rest)))?;
                if len < 0 {
                    return Ok(Value::Bulk(None));
                }
                let mut buf = vec![0; len as usize + 2];
                r.read_exact(&mut buf)?;
                buf.truncate(len as usize);
                String::from_utf8(buf).map(|s| Value::Bulk(Some(s))).map_err(
                    |_| invalid("bulk reply is not utf-8".into()))
            }
            "*" => {
                let len: i64 = rest.parse().map_err(
                    |_| invalid(format!("invalid array length: {:?}", rest)))?;
                if len < 0 {
                    return Ok(Value::Array(None));
                }
                let mut items = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    items.push(read_value(r)?);
                }
                Ok(Value::Array(Some(items)))
            }
            _ => Err(invalid(format!("invalid reply line: {:?}", line))),
        }
    }
}

use self::resp::Value;

fn from_io(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::InvalidData {
        Error::protocol(e.to_string())
    } else {
        Error::io(e.to_string())
    }
}


struct Conn {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Conn {
    fn open(addr: &str) -> Result<Conn> {
        let stream = TcpStream::connect(addr).map_err(
            |e| Error::io(format!("cannot connect to bus at {}: {}", addr, e)))?;
        stream.set_read_timeout(Some(BUS_TIMEOUT))?;
        stream.set_write_timeout(Some(BUS_TIMEOUT))?;
        let writer = stream.try_clone()?;
        Ok(Conn { reader: BufReader::new(stream), writer })
    }

    fn transact(&mut self, args: &[&str]) -> Result<Value> {
        resp::write_command(&mut self.writer, args).map_err(from_io)?;
        resp::read_value(&mut self.reader).map_err(from_io)
    }
}


/// Bus client over a TCP connection to a Redis-style server.
pub struct RedisBus {
    addr: String,
    conn: Mutex<Option<Conn>>,
}

impl RedisBus {
    /// Connect and verify the server answers a ping.
    pub fn connect(addr: &str) -> Result<RedisBus> {
        let bus = RedisBus { addr: addr.into(), conn: Mutex::new(None) };
        match bus.execute(&["PING"])? {
            Value::Simple(ref s) if s == "PONG" => Ok(bus),
            other => Err(Error::protocol(format!("unexpected ping reply: {:?}", other))),
        }
    }

    /// Run one command, reconnecting lazily.  A transport error drops the
    /// connection so the next call starts fresh.
    fn execute(&self, args: &[&str]) -> Result<Value> {
        let mut guard = self.conn.lock();
        if guard.is_none() {
            *guard = Some(Conn::open(&self.addr)?);
        }
        let res = guard.as_mut().expect("just connected").transact(args);
        match res {
            Ok(Value::Error(msg)) => Err(Error::io(format!("bus error reply: {}", msg))),
            Err(e) => {
                *guard = None;
                Err(e)
            }
            ok => ok,
        }
    }

    fn execute_ok(&self, args: &[&str]) -> Result<()> {
        self.execute(args).map(|_| ())
    }
}

impl Bus for RedisBus {
    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.execute_ok(&["SET", key, value])?;
        self.execute_ok(&["PUBLISH", key, value])
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        match self.execute(&["GET", key])? {
            Value::Bulk(v) => Ok(v),
            Value::Simple(v) => Ok(Some(v)),
            other => Err(Error::protocol(format!("unexpected get reply: {:?}", other))),
        }
    }

    fn add(&self, key: &str, value: f64) -> Result<()> {
        self.execute_ok(&["TS.ADD", key, "*", &value.to_string()])
    }

    fn latest(&self, key: &str) -> Result<Option<(u64, f64)>> {
        match self.execute(&["TS.GET", key])? {
            Value::Array(Some(items)) if items.is_empty() => Ok(None),
            Value::Array(None) => Ok(None),
            Value::Array(Some(items)) => match (items.first(), items.get(1)) {
                (Some(Value::Int(ts)), Some(Value::Bulk(Some(v)))) => {
                    let val = v.parse().map_err(
                        |_| Error::parsing(format!("non-numeric sample in {}: {:?}", key, v)))?;
                    Ok(Some((*ts as u64, val)))
                }
                _ => Err(Error::protocol(format!("unexpected sample reply for {}", key))),
            },
            other => Err(Error::protocol(format!("unexpected ts reply: {:?}", other))),
        }
    }

    fn create_ts(&self, key: &str) -> Result<()> {
        match self.execute(&["TS.CREATE", key]) {
            // the usual error reply here is "key already exists"
            Err(e) if e.is_io() => {
                debug!("creating time series {}: {}", key, e);
                Ok(())
            }
            res => res.map(|_| ()),
        }
    }

    fn subscribe(&self, channels: &[String]) -> Result<Receiver<(String, String)>> {
        let stream = TcpStream::connect(&self.addr).map_err(
            |e| Error::io(format!("cannot connect to bus at {}: {}", self.addr, e)))?;
        stream.set_write_timeout(Some(BUS_TIMEOUT))?;
        let mut writer = stream.try_clone()?;

        let mut cmd = vec!["SUBSCRIBE"];
        cmd.extend(channels.iter().map(|ch| ch.as_str()));
        resp::write_command(&mut writer, &cmd).map_err(from_io)?;

        let (sender, receiver) = unbounded();
        thread::spawn(move || {
            mlzlog::set_thread_prefix("BusSub: ");
            let mut reader = BufReader::new(stream);
            loop {
                let items = match resp::read_value(&mut reader) {
                    Ok(Value::Array(Some(items))) => items,
                    Ok(other) => {
                        warn!("unexpected push message: {:?}", other);
                        continue;
                    }
                    Err(e) => {
                        warn!("subscription read failed: {}", e);
                        return;  // drops the sender, the receiver disconnects
                    }
                };
                match (items.first(), items.get(1), items.get(2)) {
                    (Some(Value::Bulk(Some(kind))),
                     Some(Value::Bulk(Some(chan))),
                     Some(payload)) => match (kind.as_str(), payload) {
                        ("message", Value::Bulk(Some(data))) => {
                            if sender.send((chan.clone(), data.clone())).is_err() {
                                return;
                            }
                        }
                        ("subscribe", _) => debug!("subscribed to {}", chan),
                        ("unsubscribe", _) => debug!("unsubscribed from {}", chan),
                        _ => warn!("ignoring push message {:?}", kind),
                    },
                    _ => warn!("malformed push message"),
                }
            }
        });
        Ok(receiver)
    }
}


#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use super::resp::{read_value, write_command, Value};

    #[test]
    fn command_encoding() {
        let mut buf = Vec::new();
        write_command(&mut buf, &["SET", "key", "1.5"]).unwrap();
        assert_eq!(buf, b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$3\r\n1.5\r\n");
    }

    fn parse(input: &[u8]) -> Value {
        read_value(&mut Cursor::new(input)).unwrap()
    }

    #[test]
    fn reply_decoding() {
        assert_eq!(parse(b"+OK\r\n"), Value::Simple("OK".into()));
        assert_eq!(parse(b":42\r\n"), Value::Int(42));
        assert_eq!(parse(b"$5\r\nhello\r\n"), Value::Bulk(Some("hello".into())));
        assert_eq!(parse(b"$-1\r\n"), Value::Bulk(None));
        assert_eq!(parse(b"-ERR boom\r\n"), Value::Error("ERR boom".into()));
        assert_eq!(parse(b"*2\r\n:1\r\n$3\r\nfoo\r\n"),
                   Value::Array(Some(vec![Value::Int(1), Value::Bulk(Some("foo".into()))])));
        assert_eq!(parse(b"*-1\r\n"), Value::Array(None));
        assert_eq!(parse(b"*0\r\n"), Value::Array(Some(vec![])));
    }

    #[test]
    fn reply_garbage() {
        assert!(read_value(&mut Cursor::new(b"!nope\r\n" as &[u8])).is_err());
        assert!(read_value(&mut Cursor::new(b"$4\r\nab" as &[u8])).is_err());
        assert!(read_value(&mut Cursor::new(b"" as &[u8])).is_err());
    }
}
