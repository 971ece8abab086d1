//! Menu UI: five pages (home, scan list, AP detail, connect keypad,
//! status) driven by the front-panel keys from the tick loop. The model is
//! plain state plus a `handle_key` dispatcher; slow operations (scan,
//! connect) are returned as [`Action`]s for the tick loop to run, so this
//! module never awaits.

use core::fmt::Write as _;

use embedded_graphics::{
    mono_font::{ascii::FONT_6X13, MonoTextStyle},
    pixelcolor::Rgb565,
    prelude::*,
    primitives::{PrimitiveStyle, Rectangle},
    text::Text,
};
use heapless::{String, Vec};
use lcd_async::raw_framebuf::RawFrameBuf;

use crate::battery;
use crate::buttons::Key;
use crate::display::{DISPLAY_HEIGHT, DISPLAY_WIDTH};
use crate::net::{self, ScanList, WifiFailure};

const W: i32 = DISPLAY_WIDTH as i32;
const H: i32 = DISPLAY_HEIGHT as i32;

const HEADER_H: i32 = 22;
const FOOTER_H: i32 = 20;
const LINE_H: i32 = 18;

/// Visible rows on the scan list page.
const PAGE_ROWS: usize = 10;

const KEYPAD_COLS: usize = 6;
const KEYPAD_CELL_W: i32 = 36;
const KEYPAD_CELL_H: i32 = 22;
const KEYPAD_START_X: i32 = 12;
const KEYPAD_START_Y: i32 = 80;

const KEYS_123: &str = "1234567890";
const KEYS_UPPER: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const KEYS_LOWER: &str = "abcdefghijklmnopqrstuvwxyz";
const KEYS_SYM: &str = "!@#$%^&*()-_=+[]{};:'\",.<>/?\\|~` ";
const KEYPAD_PAGES: [&str; 4] = [KEYS_123, KEYS_UPPER, KEYS_LOWER, KEYS_SYM];

const BG: Rgb565 = Rgb565::WHITE;
const HEADER_BG: Rgb565 = Rgb565::new(6, 24, 25);
const FOOTER_BG: Rgb565 = Rgb565::new(29, 28, 26);
const INK: Rgb565 = Rgb565::BLACK;
const INK_DIM: Rgb565 = Rgb565::new(12, 24, 12);
const INK_ALERT: Rgb565 = Rgb565::RED;
const GAUGE: Rgb565 = Rgb565::YELLOW;
const SELECT_BG: Rgb565 = Rgb565::new(24, 54, 29);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Page {
    Home,
    List,
    Detail,
    Connect,
    Status,
}

/// Slow work the tick loop must run on the model's behalf.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    None,
    Redraw,
    /// Run a Wi-Fi scan and feed the result back via `scan_done`.
    Scan,
    /// Join `connect_ssid` with the entered PSK; feed back via `connect_done`.
    Connect,
}

pub struct UiModel {
    pub page: Page,
    stack: Vec<Page, 4>,
    pub scan: ScanList,
    sel: usize,
    first: usize,
    pub connect_ssid: String<32>,
    pub psk: String<64>,
    keypad_idx: usize,
    keypad_page: usize,
    /// Transient full-width message (connect failure, scan failure).
    pub notice: Option<&'static str>,
    /// Progress label while an Action is being serviced.
    pub busy: Option<&'static str>,
}

impl UiModel {
    pub fn new() -> Self {
        Self {
            page: Page::Home,
            stack: Vec::new(),
            scan: ScanList::new(),
            sel: 0,
            first: 0,
            connect_ssid: String::new(),
            psk: String::new(),
            keypad_idx: 0,
            keypad_page: 0,
            notice: None,
            busy: None,
        }
    }

    /// Number of labels on the current keypad page, including the trailing
    /// `PG` (next page) and `OK` (connect) keys.
    fn keypad_len(&self) -> usize {
        KEYPAD_PAGES[self.keypad_page].chars().count() + 2
    }

    fn keypad_label(&self, idx: usize) -> KeypadKey {
        let chars = KEYPAD_PAGES[self.keypad_page].chars().count();
        if idx < chars {
            KeypadKey::Char(
                KEYPAD_PAGES[self.keypad_page]
                    .chars()
                    .nth(idx)
                    .unwrap_or(' '),
            )
        } else if idx == chars {
            KeypadKey::NextPage
        } else {
            KeypadKey::Ok
        }
    }

    pub fn handle_key(&mut self, key: Key) -> Action {
        self.notice = None;
        match self.page {
            Page::Home => match key {
                Key::A => {
                    self.busy = Some("Scanning...");
                    Action::Scan
                }
                Key::B => {
                    let _ = self.stack.push(Page::Home);
                    self.page = Page::Status;
                    Action::Redraw
                }
                _ => Action::None,
            },
            Page::List => match key {
                Key::Up => {
                    self.move_selection(-1);
                    Action::Redraw
                }
                Key::Down => {
                    self.move_selection(1);
                    Action::Redraw
                }
                Key::X => {
                    self.page = Page::Home;
                    Action::Redraw
                }
                Key::B => {
                    self.page = Page::Detail;
                    Action::Redraw
                }
                Key::Y => {
                    self.enter_connect_setup();
                    Action::Redraw
                }
                _ => Action::None,
            },
            Page::Detail => match key {
                Key::X => {
                    self.page = Page::List;
                    Action::Redraw
                }
                _ => Action::None,
            },
            Page::Connect => match key {
                Key::X => {
                    self.page = Page::List;
                    Action::Redraw
                }
                Key::Up => {
                    self.keypad_move(0, -1);
                    Action::Redraw
                }
                Key::Down => {
                    self.keypad_move(0, 1);
                    Action::Redraw
                }
                Key::Left => {
                    self.keypad_move(-1, 0);
                    Action::Redraw
                }
                Key::Right => {
                    self.keypad_move(1, 0);
                    Action::Redraw
                }
                Key::Y => self.keypad_press(),
                Key::Ctrl => {
                    self.busy = Some("Connecting...");
                    Action::Connect
                }
                Key::A => {
                    self.psk.pop();
                    Action::Redraw
                }
                Key::B => {
                    self.psk.clear();
                    Action::Redraw
                }
            },
            Page::Status => match key {
                Key::X => {
                    self.page = self.stack.pop().unwrap_or(Page::Home);
                    Action::Redraw
                }
                _ => Action::None,
            },
        }
    }

    fn enter_connect_setup(&mut self) {
        self.connect_ssid.clear();
        if let Some(entry) = self.scan.get(self.sel) {
            let _ = self.connect_ssid.push_str(entry.ssid.as_str());
        }
        self.psk.clear();
        self.keypad_idx = 0;
        self.keypad_page = 0;
        self.page = Page::Connect;
    }

    fn move_selection(&mut self, delta: i32) {
        if self.scan.is_empty() {
            return;
        }
        let last = self.scan.len() - 1;
        self.sel = (self.sel as i32 + delta).clamp(0, last as i32) as usize;
        if self.sel < self.first {
            self.first = self.sel;
        } else if self.sel >= self.first + PAGE_ROWS {
            self.first = self.sel - (PAGE_ROWS - 1);
        }
    }

    fn keypad_move(&mut self, dx: i32, dy: i32) {
        let len = self.keypad_len();
        let cols = KEYPAD_COLS as i32;
        let rows = (len as i32 + cols - 1) / cols;
        let col = ((self.keypad_idx as i32 % cols) + dx).clamp(0, cols - 1);
        let row = ((self.keypad_idx as i32 / cols) + dy).clamp(0, rows - 1);
        let idx = (row * cols + col) as usize;
        if idx < len {
            self.keypad_idx = idx;
        }
    }

    fn keypad_press(&mut self) -> Action {
        match self.keypad_label(self.keypad_idx) {
            KeypadKey::Char(ch) => {
                let _ = self.psk.push(ch);
                Action::Redraw
            }
            KeypadKey::NextPage => {
                self.keypad_page = (self.keypad_page + 1) % KEYPAD_PAGES.len();
                if self.keypad_idx >= self.keypad_len() {
                    self.keypad_idx = self.keypad_len() - 1;
                }
                Action::Redraw
            }
            KeypadKey::Ok => {
                self.busy = Some("Connecting...");
                Action::Connect
            }
        }
    }

    pub fn scan_done(&mut self, result: Result<ScanList, WifiFailure>) {
        self.busy = None;
        match result {
            Ok(list) => {
                self.scan = list;
                self.sel = 0;
                self.first = 0;
                self.page = Page::List;
            }
            Err(_) => {
                self.notice = Some("Scan failed");
                self.page = Page::Home;
            }
        }
    }

    pub fn connect_done(&mut self, ok: bool) {
        self.busy = None;
        if ok {
            let _ = self.stack.push(Page::Connect);
            self.page = Page::Status;
        } else {
            self.notice = Some("Connect failed - check password or signal");
            self.page = Page::Connect;
        }
    }
}

enum KeypadKey {
    Char(char),
    NextPage,
    Ok,
}

type Frame<'a> = RawFrameBuf<Rgb565, &'a mut [u8]>;

pub fn render(frame: &mut Frame<'_>, ui: &UiModel) {
    fill(frame, 0, 0, W, H, BG);

    if let Some(busy) = ui.busy {
        header(frame, busy);
        text(frame, "Please wait", 6, 66, INK_DIM);
        return;
    }

    match ui.page {
        Page::Home => render_home(frame, ui),
        Page::List => render_list(frame, ui),
        Page::Detail => render_detail(frame, ui),
        Page::Connect => render_connect(frame, ui),
        Page::Status => render_status(frame, ui),
    }
}

fn render_home(frame: &mut Frame<'_>, ui: &UiModel) {
    header(frame, "Home");
    text(frame, "Welcome!", 88, 90, INK);
    text(frame, "Press A to Scan Wi-Fi", 40, 110, INK);
    text(frame, "Press B to Show Status", 36, 130, INK);
    if let Some(notice) = ui.notice {
        text(frame, notice, 12, 160, INK_ALERT);
    }
    footer(frame, "(A) Scan", "(B) Status");
}

fn render_list(frame: &mut Frame<'_>, ui: &UiModel) {
    header(frame, "Networks");
    if ui.scan.is_empty() {
        text(frame, "No networks found", 6, HEADER_H + 20, INK_DIM);
    }
    let mut y = HEADER_H + 14;
    for (idx, entry) in ui
        .scan
        .iter()
        .enumerate()
        .skip(ui.first)
        .take(PAGE_ROWS)
    {
        if idx == ui.sel {
            fill(frame, 0, y - 12, W, LINE_H, SELECT_BG);
        }
        let mut line: String<40> = String::new();
        let _ = write!(line, "{:>4} {}", entry.rssi, entry.ssid.as_str());
        text(frame, line.as_str(), 6, y, INK);
        y += LINE_H;
    }
    footer(frame, "(Y) Join  (B) Info", "(X) Back");
}

fn render_detail(frame: &mut Frame<'_>, ui: &UiModel) {
    header(frame, "AP Detail");
    let mut y = HEADER_H + 20;
    match ui.scan.get(ui.sel) {
        Some(entry) => {
            let mut line: String<48> = String::new();
            let _ = write!(line, "SSID: {}", entry.ssid.as_str());
            text(frame, line.as_str(), 6, y, INK);
            y += LINE_H;

            line.clear();
            let b = entry.bssid;
            let _ = write!(
                line,
                "BSSID: {:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
                b[0], b[1], b[2], b[3], b[4], b[5]
            );
            text(frame, line.as_str(), 6, y, INK);
            y += LINE_H;

            line.clear();
            let _ = write!(line, "Channel: {}", entry.channel);
            text(frame, line.as_str(), 6, y, INK);
            y += LINE_H;

            line.clear();
            let _ = write!(line, "RSSI: {} dBm", entry.rssi);
            text(frame, line.as_str(), 6, y, INK);
            y += LINE_H;

            line.clear();
            let _ = write!(line, "Auth: {}", entry.auth);
            text(frame, line.as_str(), 6, y, INK);
        }
        None => text(frame, "Nothing selected", 6, y, INK_DIM),
    }
    footer(frame, "", "(X) Back");
}

fn render_connect(frame: &mut Frame<'_>, ui: &UiModel) {
    header(frame, "Join Network");

    let mut line: String<48> = String::new();
    let _ = write!(line, "SSID: {}", ui.connect_ssid.as_str());
    text(frame, line.as_str(), 6, HEADER_H + 14, INK);

    // Masked past characters, last one visible while typing.
    line.clear();
    let _ = line.push_str("PSK: ");
    let count = ui.psk.chars().count();
    for (idx, ch) in ui.psk.chars().enumerate() {
        let shown = if idx + 1 == count { ch } else { '*' };
        if line.push(shown).is_err() {
            break;
        }
    }
    text(frame, line.as_str(), 6, HEADER_H + 34, INK);

    if let Some(notice) = ui.notice {
        text(frame, notice, 6, HEADER_H + 52, INK_ALERT);
    }

    for idx in 0..ui.keypad_len() {
        let col = (idx % KEYPAD_COLS) as i32;
        let row = (idx / KEYPAD_COLS) as i32;
        let x = KEYPAD_START_X + col * KEYPAD_CELL_W;
        let y = KEYPAD_START_Y + row * KEYPAD_CELL_H;
        if idx == ui.keypad_idx {
            fill(frame, x - 2, y - 12, KEYPAD_CELL_W - 4, KEYPAD_CELL_H - 4, SELECT_BG);
        }
        let mut label: String<4> = String::new();
        match ui.keypad_label(idx) {
            KeypadKey::Char(ch) => {
                let _ = label.push(ch);
            }
            KeypadKey::NextPage => {
                let _ = label.push_str("PG");
            }
            KeypadKey::Ok => {
                let _ = label.push_str("OK");
            }
        }
        text(frame, label.as_str(), x, y, INK);
    }

    footer(frame, "(Y) Key  (A) Del  (B) Clr", "(CTRL) Join");
}

fn render_status(frame: &mut Frame<'_>, _ui: &UiModel) {
    header(frame, "Connection Status");
    let mut y = HEADER_H + 14;
    let mut line: String<48> = String::new();

    if let Some(batt) = battery::last_reading() {
        let _ = write!(line, "Batt V : {:.2}V", batt.volts);
        text(frame, line.as_str(), 6, y, INK);
        y += LINE_H;
        line.clear();
        let _ = write!(line, "Batt I : {:.3}A", batt.amps);
        text(frame, line.as_str(), 6, y, INK);
        y += LINE_H;
        line.clear();
        let _ = write!(line, "Batt % : {}%", batt.percent);
        text(frame, line.as_str(), 6, y, INK);
        y += LINE_H;
        line.clear();
    }

    let state = net::wifi_snapshot();
    let _ = write!(line, "Active   : {}", state.sta_started);
    text(frame, line.as_str(), 6, y, INK);
    y += LINE_H;
    line.clear();
    let _ = write!(line, "Connected: {}", state.sta_connected);
    text(frame, line.as_str(), 6, y, INK);
    y += LINE_H;

    if state.sta_connected {
        if let Some(ip) = state.sta_ip {
            line.clear();
            let _ = write!(line, "IP  : {}", ip);
            text(frame, line.as_str(), 6, y, INK);
            y += LINE_H;
        }
        if let Some(gw) = state.sta_gateway {
            line.clear();
            let _ = write!(line, "GW  : {}", gw);
            text(frame, line.as_str(), 6, y, INK);
            y += LINE_H;
        }
        if let Some(dns) = state.sta_dns {
            line.clear();
            let _ = write!(line, "DNS : {}", dns);
            text(frame, line.as_str(), 6, y, INK);
            y += LINE_H;
        }
        if let Some(rssi) = state.rssi {
            line.clear();
            let _ = write!(line, "RSSI: {} dBm", rssi);
            text(frame, line.as_str(), 6, y, INK);
            y += LINE_H;
        }
    } else {
        text(frame, "Not connected to any AP", 6, y, INK);
        y += LINE_H;
    }

    line.clear();
    let _ = write!(line, "AP  : {} ({} client(s))", crate::AP_SSID, net::ap_client_count());
    text(frame, line.as_str(), 6, y, INK);

    footer(frame, "", "(X) Back");
}

fn header(frame: &mut Frame<'_>, title: &str) {
    fill(frame, 0, 0, W, HEADER_H, HEADER_BG);
    text(frame, title, 6, 15, Rgb565::WHITE);

    let gauge = battery::gauge_text();
    if !gauge.is_empty() {
        text(frame, gauge.as_str(), W - 40, 15, GAUGE);
    }
}

fn footer(frame: &mut Frame<'_>, left: &str, right: &str) {
    fill(frame, 0, H - FOOTER_H, W, FOOTER_H, FOOTER_BG);
    if !left.is_empty() {
        text(frame, left, 6, H - 6, INK);
    }
    if !right.is_empty() {
        text(frame, right, W - 6 - 6 * right.len() as i32, H - 6, INK);
    }
}

fn fill(frame: &mut Frame<'_>, x: i32, y: i32, w: i32, h: i32, color: Rgb565) {
    let _ = Rectangle::new(Point::new(x, y), Size::new(w.max(0) as u32, h.max(0) as u32))
        .into_styled(PrimitiveStyle::with_fill(color))
        .draw(frame);
}

fn text(frame: &mut Frame<'_>, s: &str, x: i32, y: i32, color: Rgb565) {
    let style = MonoTextStyle::new(&FONT_6X13, color);
    let _ = Text::new(s, Point::new(x, y), style).draw(frame);
}
