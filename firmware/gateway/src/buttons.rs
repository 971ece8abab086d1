//! The nine front-panel keys (A/B/X/Y, joystick, joystick press), active
//! low with internal pull-ups. Debounce is a single shared gate: any
//! accepted press arms a quiet window during which further presses are
//! ignored, which is plenty for menu navigation.

use embassy_time::{Duration, Instant, Timer};
use esp_hal::gpio::Input;

pub const DEBOUNCE_MS: u64 = 160;
pub const HOLD_MS: u64 = 600;
const RELEASE_POLL: Duration = Duration::from_millis(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Key {
    A,
    B,
    X,
    Y,
    Up,
    Down,
    Left,
    Right,
    Ctrl,
}

pub const ALL_KEYS: [Key; 9] = [
    Key::A,
    Key::B,
    Key::X,
    Key::Y,
    Key::Up,
    Key::Down,
    Key::Left,
    Key::Right,
    Key::Ctrl,
];

pub struct Buttons {
    a: Input<'static>,
    b: Input<'static>,
    x: Input<'static>,
    y: Input<'static>,
    up: Input<'static>,
    down: Input<'static>,
    left: Input<'static>,
    right: Input<'static>,
    ctrl: Input<'static>,
    last_accept: Instant,
}

impl Buttons {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        a: Input<'static>,
        b: Input<'static>,
        x: Input<'static>,
        y: Input<'static>,
        up: Input<'static>,
        down: Input<'static>,
        left: Input<'static>,
        right: Input<'static>,
        ctrl: Input<'static>,
    ) -> Self {
        Self {
            a,
            b,
            x,
            y,
            up,
            down,
            left,
            right,
            ctrl,
            last_accept: Instant::MIN,
        }
    }

    fn input(&self, key: Key) -> &Input<'static> {
        match key {
            Key::A => &self.a,
            Key::B => &self.b,
            Key::X => &self.x,
            Key::Y => &self.y,
            Key::Up => &self.up,
            Key::Down => &self.down,
            Key::Left => &self.left,
            Key::Right => &self.right,
            Key::Ctrl => &self.ctrl,
        }
    }

    pub fn pressed(&self, key: Key) -> bool {
        self.input(key).is_low()
    }

    /// The first pressed key this tick, or `None`. Scan order matches
    /// [`ALL_KEYS`].
    pub fn scan(&self) -> Option<Key> {
        ALL_KEYS.into_iter().find(|&key| self.pressed(key))
    }

    /// Accept a press only if the debounce window since the previous
    /// accepted press has elapsed.
    pub fn debounce(&mut self) -> bool {
        self.gate(DEBOUNCE_MS)
    }

    /// Accept a press only after the longer hold window, for actions that
    /// must not fire on a stray tap (joining a network, for one).
    pub fn hold_gate(&mut self) -> bool {
        self.gate(HOLD_MS)
    }

    fn gate(&mut self, window_ms: u64) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last_accept) < Duration::from_millis(window_ms) {
            return false;
        }
        self.last_accept = now;
        true
    }

    /// Wait until `key` is released, bounded so a stuck switch cannot park
    /// the tick loop.
    pub async fn wait_release(&self, key: Key) {
        let deadline = Instant::now() + Duration::from_millis(HOLD_MS);
        while self.pressed(key) && Instant::now() < deadline {
            Timer::after(RELEASE_POLL).await;
        }
    }
}
