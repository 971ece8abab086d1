#![no_std]

//! Command grammar and dispatcher for the ModGate appliance.
//!
//! The dispatcher is a pure function: it parses one line of text and queries
//! the collaborators it is handed, producing exactly one reply line. Replies
//! always start with `OK` or `ERR` and carry no trailing newline; the
//! transport appends one when writing to the wire. All variability comes
//! from the collaborators; the dispatcher itself holds no state and never
//! retries.

use core::fmt::Write as _;

use heapless::String;

/// Upper bound for one reply. Large enough for the multi-line `SYS` reports
/// and a full `RS RECV` payload with its prefix.
pub const REPLY_CAP: usize = 512;

pub type Reply = String<REPLY_CAP>;

/// Cap for a single `MB R HR` read so the synthesized register list always
/// fits inside [`REPLY_CAP`].
pub const MAX_HR_READ: i32 = 64;

/// Default and maximum byte count for `RS RECV`.
pub const RECV_BUF_CAP: usize = 256;

/// Base value for synthesized holding registers: register `addr + i` reads
/// as `1234 + i`.
const HR_SYNTH_BASE: i32 = 1234;

/// An IPv4 address as the dispatcher renders it (`a.b.c.d`).
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Ipv4(pub [u8; 4]);

impl core::fmt::Display for Ipv4 {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{}.{}.{}.{}", a, b, c, d)
    }
}

/// Error surfaced by a collaborator. The message is truncated to a bounded
/// length before it is embedded in an `ERR` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollabError {
    msg: String<64>,
}

impl CollabError {
    pub fn new(msg: &str) -> Self {
        let mut out: String<64> = String::new();
        for ch in msg.chars() {
            if out.push(ch).is_err() {
                break;
            }
        }
        Self { msg: out }
    }

    pub fn as_str(&self) -> &str {
        self.msg.as_str()
    }
}

/// Interface configuration snapshot reported by `SYS STATUS`.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, Default)]
pub struct IfConfig {
    pub ip: Ipv4,
    pub netmask: Ipv4,
    pub gateway: Ipv4,
    pub dns: Ipv4,
}

/// Wi-Fi link snapshot reported by `SYS WIFI`.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, Default)]
pub struct WifiReport {
    pub active: bool,
    pub connected: bool,
    pub ip: Ipv4,
    pub rssi: Option<i8>,
}

/// Read-only view of the network interface state.
pub trait NetworkStatus {
    fn ifconfig(&self) -> Result<IfConfig, CollabError>;
    fn wifi(&self) -> Result<WifiReport, CollabError>;
}

/// One of the RS-485 channels. `send` returns the number of bytes written;
/// `recv` drains only bytes that are already buffered (it never waits).
pub trait SerialChannel {
    fn send(&mut self, channel: u8, data: &[u8]) -> Result<usize, CollabError>;
    fn recv(&mut self, channel: u8, buf: &mut [u8]) -> Result<usize, CollabError>;
}

/// The status LED.
pub trait Indicator {
    fn set(&mut self, on: bool);
}

/// The collaborators a dispatch call may query.
pub struct Services<'a> {
    pub net: &'a dyn NetworkStatus,
    pub serial: &'a mut dyn SerialChannel,
    pub indicator: &'a mut dyn Indicator,
}

/// Parse and execute one command line.
///
/// Verbs and sub-verbs are case-insensitive; arguments are
/// whitespace-separated. Unknown or malformed input is reported as an
/// `ERR ...` reply, never an error value; the caller only ever sees one
/// line of text to put on the wire.
pub fn dispatch(raw: &str, services: &mut Services<'_>) -> Reply {
    let cmd = raw.trim();
    if cmd.is_empty() {
        return reply("ERR EMPTY");
    }

    let mut tokens = cmd.split_whitespace();
    let name = match tokens.next() {
        Some(t) => t,
        None => return reply("ERR EMPTY"),
    };

    if name.eq_ignore_ascii_case("SYS") {
        sys_command(&mut tokens, services)
    } else if name.eq_ignore_ascii_case("LED") {
        led_command(&mut tokens, services)
    } else if name.eq_ignore_ascii_case("MB") {
        modbus_command(&mut tokens)
    } else if name.eq_ignore_ascii_case("RS") {
        serial_command(&mut tokens, services)
    } else if name.eq_ignore_ascii_case("STATUS") {
        // Legacy alias kept for pre-SYS clients.
        dispatch("SYS STATUS", services)
    } else {
        let mut out = Reply::new();
        let _ = write!(out, "ERR UNKNOWN CMD: {}", cmd);
        out
    }
}

fn sys_command<'a, I>(args: &mut I, services: &mut Services<'_>) -> Reply
where
    I: Iterator<Item = &'a str>,
{
    let sub = match args.next() {
        Some(s) => s,
        None => return reply("ERR SYS ARG"),
    };

    let mut out = Reply::new();
    if sub.eq_ignore_ascii_case("STATUS") {
        match services.net.ifconfig() {
            Ok(cfg) => {
                let _ = write!(
                    out,
                    "OK SYS STATUS \nIP={} \nNETMASK={} \nGW={} \nDNS={}",
                    cfg.ip, cfg.netmask, cfg.gateway, cfg.dns
                );
            }
            Err(e) => {
                let _ = write!(out, "ERR SYS STATUS {}", e.as_str());
            }
        }
    } else if sub.eq_ignore_ascii_case("WIFI") {
        match services.net.wifi() {
            Ok(w) => {
                let _ = write!(
                    out,
                    "OK SYS WIFI \nACTIVE={} \nCONNECTED={} \nIP={} \nRSSI=",
                    w.active, w.connected, w.ip
                );
                match w.rssi {
                    Some(rssi) => {
                        let _ = write!(out, "{}", rssi);
                    }
                    None => {
                        let _ = out.push_str("NA");
                    }
                }
            }
            Err(e) => {
                let _ = write!(out, "ERR SYS WIFI {}", e.as_str());
            }
        }
    } else if sub.eq_ignore_ascii_case("PING") {
        let _ = out.push_str("OK SYS PING");
    } else if sub.eq_ignore_ascii_case("HELP") {
        let _ = out.push_str(
            "OK SYS CMDS: \nSYS STATUS \nSYS WIFI \nSYS PING \nSYS HELP \
             \nLED ON/OFF \nMB R HR \nMB W HR \nRS SEND \nRS RECV \nSTATUS",
        );
    } else {
        let _ = write!(out, "ERR SYS UNKNOWN {}", sub);
    }
    out
}

fn led_command<'a, I>(args: &mut I, services: &mut Services<'_>) -> Reply
where
    I: Iterator<Item = &'a str>,
{
    let arg = match args.next() {
        Some(a) => a,
        None => return reply("ERR LED ARG"),
    };

    let mut out = Reply::new();
    if arg.eq_ignore_ascii_case("ON") {
        services.indicator.set(true);
        let _ = out.push_str("OK LED=ON");
    } else if arg.eq_ignore_ascii_case("OFF") {
        services.indicator.set(false);
        let _ = out.push_str("OK LED=OFF");
    } else {
        let _ = write!(out, "ERR LED {}", arg);
    }
    out
}

fn modbus_command<'a, I>(args: &mut I) -> Reply
where
    I: Iterator<Item = &'a str>,
{
    let (rw, area, slave_s, addr_s) = match (args.next(), args.next(), args.next(), args.next()) {
        (Some(a), Some(b), Some(c), Some(d)) => (a, b, c, d),
        _ => return reply("ERR MB ARG"),
    };

    let (slave, addr) = match (slave_s.parse::<i32>(), addr_s.parse::<i32>()) {
        (Ok(s), Ok(a)) => (s, a),
        _ => return reply("ERR MB NUM"),
    };

    let mut out = Reply::new();
    if rw.eq_ignore_ascii_case("R") && area.eq_ignore_ascii_case("HR") {
        let count_s = match args.next() {
            Some(c) => c,
            None => return reply("ERR MB RHR ARG"),
        };
        let count = match count_s.parse::<i32>() {
            Ok(c) => c,
            Err(_) => return reply("ERR MB RHR NUM"),
        };
        if !(0..=MAX_HR_READ).contains(&count) {
            return reply("ERR MB RHR ARG");
        }

        // Modbus backend stub: registers read as a synthesized ramp.
        let _ = write!(out, "OK MB R HR {} {}", slave, addr);
        for i in 0..count {
            let _ = write!(out, " {}", HR_SYNTH_BASE + i);
        }
    } else if rw.eq_ignore_ascii_case("W") && area.eq_ignore_ascii_case("HR") {
        let value_s = match args.next() {
            Some(v) => v,
            None => return reply("ERR MB WHR ARG"),
        };
        let value = match value_s.parse::<i32>() {
            Ok(v) => v,
            Err(_) => return reply("ERR MB WHR NUM"),
        };

        // Write is acknowledged without touching real hardware.
        let _ = write!(out, "OK MB W HR {} {} {}", slave, addr, value);
    } else {
        let _ = out.push_str("ERR MB UNSUPPORTED ");
        push_upper(&mut out, rw);
        let _ = out.push(' ');
        push_upper(&mut out, area);
    }
    out
}

fn serial_command<'a, I>(args: &mut I, services: &mut Services<'_>) -> Reply
where
    I: Iterator<Item = &'a str>,
{
    let sub = match args.next() {
        Some(s) => s,
        None => return reply("ERR RS ARG"),
    };

    let mut out = Reply::new();
    if sub.eq_ignore_ascii_case("SEND") {
        let ch_s = match args.next() {
            Some(c) => c,
            None => return reply("ERR RS SEND ARG"),
        };
        let ch = match ch_s.parse::<i32>() {
            Ok(c) => c,
            Err(_) => return reply("ERR RS CH"),
        };

        // Re-join the remaining tokens; the payload goes out with a CRLF
        // terminator like any line-oriented RS-485 peer expects.
        let mut payload: String<RECV_BUF_CAP> = String::new();
        let mut any = false;
        for tok in args {
            if any && payload.push(' ').is_err() {
                return reply("ERR RS SEND OVERFLOW");
            }
            if payload.push_str(tok).is_err() {
                return reply("ERR RS SEND OVERFLOW");
            }
            any = true;
        }
        if !any {
            return reply("ERR RS SEND ARG");
        }
        if payload.push_str("\r\n").is_err() {
            return reply("ERR RS SEND OVERFLOW");
        }

        let channel = match u8::try_from(ch) {
            Ok(c) => c,
            Err(_) => return reply("ERR RS SEND channel must be 0 or 1"),
        };
        match services.serial.send(channel, payload.as_bytes()) {
            Ok(n) => {
                let _ = write!(out, "OK RS SEND {} {}B", ch, n);
            }
            Err(e) => {
                let _ = write!(out, "ERR RS SEND {}", e.as_str());
            }
        }
    } else if sub.eq_ignore_ascii_case("RECV") {
        let ch_s = match args.next() {
            Some(c) => c,
            None => return reply("ERR RS RECV ARG"),
        };
        let (ch, max) = match (ch_s.parse::<i32>(), args.next()) {
            (Ok(c), None) => (c, RECV_BUF_CAP),
            (Ok(c), Some(m)) => match m.parse::<usize>() {
                Ok(m) => (c, m.min(RECV_BUF_CAP)),
                Err(_) => return reply("ERR RS NUM"),
            },
            (Err(_), _) => return reply("ERR RS NUM"),
        };

        let channel = match u8::try_from(ch) {
            Ok(c) => c,
            Err(_) => return reply("ERR RS RECV channel must be 0 or 1"),
        };
        let mut buf = [0u8; RECV_BUF_CAP];
        match services.serial.recv(channel, &mut buf[..max]) {
            Ok(n) => {
                let _ = write!(out, "OK RS RECV {} {}B ", ch, n);
                push_lossy(&mut out, &buf[..n]);
            }
            Err(e) => {
                let _ = write!(out, "ERR RS RECV {}", e.as_str());
            }
        }
    } else {
        let _ = write!(out, "ERR RS UNKNOWN {}", sub);
    }
    out
}

fn reply(text: &str) -> Reply {
    let mut out = Reply::new();
    let _ = out.push_str(text);
    out
}

fn push_upper(out: &mut Reply, token: &str) {
    for ch in token.chars() {
        let _ = out.push(ch.to_ascii_uppercase());
    }
}

/// Append `bytes` as text, skipping invalid UTF-8 sequences outright.
/// Serial peers are free to emit binary noise; it must not poison the reply.
fn push_lossy(out: &mut Reply, mut bytes: &[u8]) {
    loop {
        match core::str::from_utf8(bytes) {
            Ok(s) => {
                let _ = out.push_str(s);
                return;
            }
            Err(err) => {
                let valid = err.valid_up_to();
                if valid > 0 {
                    // Valid prefix is valid UTF-8 by construction.
                    if let Ok(s) = core::str::from_utf8(&bytes[..valid]) {
                        let _ = out.push_str(s);
                    }
                }
                let skip = match err.error_len() {
                    Some(len) => valid + len,
                    None => return, // truncated sequence at the end
                };
                bytes = &bytes[skip..];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeNet {
        fail: bool,
    }

    impl NetworkStatus for FakeNet {
        fn ifconfig(&self) -> Result<IfConfig, CollabError> {
            if self.fail {
                return Err(CollabError::new("interface down"));
            }
            Ok(IfConfig {
                ip: Ipv4([192, 168, 4, 1]),
                netmask: Ipv4([255, 255, 255, 0]),
                gateway: Ipv4([192, 168, 4, 1]),
                dns: Ipv4([8, 8, 8, 8]),
            })
        }

        fn wifi(&self) -> Result<WifiReport, CollabError> {
            if self.fail {
                return Err(CollabError::new("radio off"));
            }
            Ok(WifiReport {
                active: true,
                connected: false,
                ip: Ipv4([0, 0, 0, 0]),
                rssi: None,
            })
        }
    }

    struct FakeSerial {
        sent: heapless::Vec<u8, 64>,
        pending: heapless::Vec<u8, 64>,
        fail: bool,
    }

    impl FakeSerial {
        fn new() -> Self {
            Self {
                sent: heapless::Vec::new(),
                pending: heapless::Vec::new(),
                fail: false,
            }
        }
    }

    impl SerialChannel for FakeSerial {
        fn send(&mut self, channel: u8, data: &[u8]) -> Result<usize, CollabError> {
            if channel > 1 {
                return Err(CollabError::new("channel must be 0 or 1"));
            }
            if self.fail {
                return Err(CollabError::new("uart busy"));
            }
            self.sent.extend_from_slice(data).unwrap();
            Ok(data.len())
        }

        fn recv(&mut self, channel: u8, buf: &mut [u8]) -> Result<usize, CollabError> {
            if channel > 1 {
                return Err(CollabError::new("channel must be 0 or 1"));
            }
            let n = self.pending.len().min(buf.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            Ok(n)
        }
    }

    struct FakeLed {
        on: bool,
    }

    impl Indicator for FakeLed {
        fn set(&mut self, on: bool) {
            self.on = on;
        }
    }

    fn run(cmd: &str) -> Reply {
        let net = FakeNet { fail: false };
        let mut serial = FakeSerial::new();
        let mut led = FakeLed { on: false };
        let mut services = Services {
            net: &net,
            serial: &mut serial,
            indicator: &mut led,
        };
        dispatch(cmd, &mut services)
    }

    #[test]
    fn every_reply_starts_with_ok_or_err() {
        for cmd in [
            "SYS STATUS",
            "SYS WIFI",
            "SYS PING",
            "SYS HELP",
            "LED ON",
            "LED OFF",
            "MB R HR 1 0 3",
            "MB W HR 1 0 99",
            "RS SEND 0 hello",
            "RS RECV 0",
            "STATUS",
            "",
            "FOO BAR",
            "MB R HR x y z",
        ] {
            let r = run(cmd);
            assert!(
                r.starts_with("OK ") || r.starts_with("ERR ") || r.as_str() == "ERR EMPTY",
                "unexpected reply for {:?}: {:?}",
                cmd,
                r.as_str()
            );
        }
    }

    #[test]
    fn ping_and_empty() {
        assert_eq!(run("SYS PING").as_str(), "OK SYS PING");
        assert_eq!(run("").as_str(), "ERR EMPTY");
        assert_eq!(run("   \t ").as_str(), "ERR EMPTY");
    }

    #[test]
    fn verbs_are_case_insensitive() {
        assert_eq!(run("sys ping").as_str(), "OK SYS PING");
        assert_eq!(run("Led On").as_str(), "OK LED=ON");
    }

    #[test]
    fn holding_register_read_synthesizes_ramp() {
        assert_eq!(
            run("MB R HR 1 0 3").as_str(),
            "OK MB R HR 1 0 1234 1235 1236"
        );
        assert_eq!(run("MB R HR 7 100 1").as_str(), "OK MB R HR 7 100 1234");
        assert_eq!(run("MB R HR 1 0 0").as_str(), "OK MB R HR 1 0");
    }

    #[test]
    fn holding_register_write_acknowledges() {
        assert_eq!(run("MB W HR 1 0 99").as_str(), "OK MB W HR 1 0 99");
        assert_eq!(run("MB W HR 3 10 -5").as_str(), "OK MB W HR 3 10 -5");
    }

    #[test]
    fn modbus_argument_errors() {
        assert_eq!(run("MB R HR 1").as_str(), "ERR MB ARG");
        assert_eq!(run("MB R HR one 0 3").as_str(), "ERR MB NUM");
        assert_eq!(run("MB R HR 1 0").as_str(), "ERR MB RHR ARG");
        assert_eq!(run("MB R HR 1 0 many").as_str(), "ERR MB RHR NUM");
        assert_eq!(run("MB R HR 1 0 65").as_str(), "ERR MB RHR ARG");
        assert_eq!(run("MB W HR 1 0").as_str(), "ERR MB WHR ARG");
        assert_eq!(run("MB W HR 1 0 x").as_str(), "ERR MB WHR NUM");
        assert_eq!(run("MB R COIL 1 0 3").as_str(), "ERR MB UNSUPPORTED R COIL");
    }

    #[test]
    fn unknown_tokens_are_reported_in_context() {
        assert!(run("FOO BAR").starts_with("ERR UNKNOWN CMD"));
        assert_eq!(run("SYS NOPE").as_str(), "ERR SYS UNKNOWN NOPE");
        assert_eq!(run("RS NOPE").as_str(), "ERR RS UNKNOWN NOPE");
        assert_eq!(run("LED BLINK").as_str(), "ERR LED BLINK");
    }

    #[test]
    fn led_drives_indicator() {
        let net = FakeNet { fail: false };
        let mut serial = FakeSerial::new();
        let mut led = FakeLed { on: false };
        let mut services = Services {
            net: &net,
            serial: &mut serial,
            indicator: &mut led,
        };
        assert_eq!(dispatch("LED ON", &mut services).as_str(), "OK LED=ON");
        assert!(led.on);
        let mut services = Services {
            net: &net,
            serial: &mut serial,
            indicator: &mut led,
        };
        assert_eq!(dispatch("LED OFF", &mut services).as_str(), "OK LED=OFF");
        assert!(!led.on);
    }

    #[test]
    fn status_is_a_sys_status_alias() {
        assert_eq!(run("STATUS").as_str(), run("SYS STATUS").as_str());
        assert!(run("STATUS").starts_with("OK SYS STATUS"));
    }

    #[test]
    fn sys_status_reports_ifconfig() {
        assert_eq!(
            run("SYS STATUS").as_str(),
            "OK SYS STATUS \nIP=192.168.4.1 \nNETMASK=255.255.255.0 \nGW=192.168.4.1 \nDNS=8.8.8.8"
        );
    }

    #[test]
    fn sys_wifi_renders_missing_rssi_as_na() {
        assert_eq!(
            run("SYS WIFI").as_str(),
            "OK SYS WIFI \nACTIVE=true \nCONNECTED=false \nIP=0.0.0.0 \nRSSI=NA"
        );
    }

    #[test]
    fn collaborator_failures_become_err_lines() {
        let net = FakeNet { fail: true };
        let mut serial = FakeSerial::new();
        serial.fail = true;
        let mut led = FakeLed { on: false };
        let mut services = Services {
            net: &net,
            serial: &mut serial,
            indicator: &mut led,
        };
        assert_eq!(
            dispatch("SYS STATUS", &mut services).as_str(),
            "ERR SYS STATUS interface down"
        );
        assert_eq!(
            dispatch("SYS WIFI", &mut services).as_str(),
            "ERR SYS WIFI radio off"
        );
        assert_eq!(
            dispatch("RS SEND 0 hi", &mut services).as_str(),
            "ERR RS SEND uart busy"
        );
    }

    #[test]
    fn serial_send_appends_crlf_and_counts_bytes() {
        let net = FakeNet { fail: false };
        let mut serial = FakeSerial::new();
        let mut led = FakeLed { on: false };
        let mut services = Services {
            net: &net,
            serial: &mut serial,
            indicator: &mut led,
        };
        let r = dispatch("RS SEND 0 AT STATUS", &mut services);
        assert_eq!(r.as_str(), "OK RS SEND 0 11B");
        assert_eq!(&serial.sent[..], b"AT STATUS\r\n");
    }

    #[test]
    fn serial_recv_reports_byte_count_and_text() {
        let net = FakeNet { fail: false };
        let mut serial = FakeSerial::new();
        serial.pending.extend_from_slice(b"ready").unwrap();
        let mut led = FakeLed { on: false };
        let mut services = Services {
            net: &net,
            serial: &mut serial,
            indicator: &mut led,
        };
        assert_eq!(
            dispatch("RS RECV 1", &mut services).as_str(),
            "OK RS RECV 1 5B ready"
        );
    }

    #[test]
    fn serial_recv_drops_invalid_utf8() {
        let net = FakeNet { fail: false };
        let mut serial = FakeSerial::new();
        serial.pending.extend_from_slice(b"ok\xff\xfe!").unwrap();
        let mut led = FakeLed { on: false };
        let mut services = Services {
            net: &net,
            serial: &mut serial,
            indicator: &mut led,
        };
        assert_eq!(
            dispatch("RS RECV 0 8", &mut services).as_str(),
            "OK RS RECV 0 5B ok!"
        );
    }

    #[test]
    fn serial_argument_errors() {
        assert_eq!(run("RS").as_str(), "ERR RS ARG");
        assert_eq!(run("RS SEND").as_str(), "ERR RS SEND ARG");
        assert_eq!(run("RS SEND 0").as_str(), "ERR RS SEND ARG");
        assert_eq!(run("RS SEND x hi").as_str(), "ERR RS CH");
        assert_eq!(run("RS RECV").as_str(), "ERR RS RECV ARG");
        assert_eq!(run("RS RECV x").as_str(), "ERR RS NUM");
        assert_eq!(run("RS RECV 0 many").as_str(), "ERR RS NUM");
        assert!(run("RS SEND 9 hi").starts_with("ERR RS SEND channel"));
    }
}
