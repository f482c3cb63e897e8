//! Synthetic interaction profiles
//!
//! A profile is the timed sequence of pointer moves and key presses that a
//! scenario replays into the page. Two strategies exist:
//!
//! - [`BotStrategy`]: evenly spaced samples on the straight start→end line,
//!   constant step delay, keys typed back-to-back.
//! - [`HumanStrategy`]: more samples, per-axis jitter plus a sine-shaped
//!   lateral arc peaking at the midpoint, random step cadence and random
//!   per-key delays.
//!
//! Randomness always comes from the caller so a seeded RNG reproduces a run.

use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

/// A point in viewport coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// One replayable input event
#[derive(Debug, Clone, PartialEq)]
pub enum InteractionEvent {
    PointerMove { x: f64, y: f64, delay_before: Duration },
    KeyPress { ch: char, delay_before: Duration },
}

impl InteractionEvent {
    pub fn delay_before(&self) -> Duration {
        match self {
            InteractionEvent::PointerMove { delay_before, .. }
            | InteractionEvent::KeyPress { delay_before, .. } => *delay_before,
        }
    }
}

/// Behavioral class a profile imitates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Behavior {
    Bot,
    Human,
}

impl Behavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            Behavior::Bot => "bot",
            Behavior::Human => "human",
        }
    }

    /// Strategy for this behavior with the configured parameters
    pub fn strategy<'a>(&self, profiles: &'a ProfileSettings) -> &'a dyn ProfileStrategy {
        match self {
            Behavior::Bot => &profiles.bot,
            Behavior::Human => &profiles.human,
        }
    }
}

impl fmt::Display for Behavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Behavior {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bot" => Ok(Behavior::Bot),
            "human" => Ok(Behavior::Human),
            other => Err(format!("unknown behavior '{}' (expected bot or human)", other)),
        }
    }
}

/// An immutable, ordered sequence of timed events
#[derive(Debug, Clone, PartialEq)]
pub struct InteractionProfile {
    behavior: Behavior,
    events: Vec<InteractionEvent>,
}

impl InteractionProfile {
    pub fn new(behavior: Behavior, events: Vec<InteractionEvent>) -> Self {
        Self { behavior, events }
    }

    pub fn behavior(&self) -> Behavior {
        self.behavior
    }

    pub fn events(&self) -> &[InteractionEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Pointer samples in replay order
    pub fn pointer_path(&self) -> Vec<Point> {
        self.events
            .iter()
            .filter_map(|e| match e {
                InteractionEvent::PointerMove { x, y, .. } => Some(Point::new(*x, *y)),
                _ => None,
            })
            .collect()
    }

    /// Delays preceding each pointer move
    pub fn pointer_delays(&self) -> Vec<Duration> {
        self.events
            .iter()
            .filter_map(|e| match e {
                InteractionEvent::PointerMove { delay_before, .. } => Some(*delay_before),
                _ => None,
            })
            .collect()
    }

    /// Delays preceding each key press
    pub fn key_delays(&self) -> Vec<Duration> {
        self.events
            .iter()
            .filter_map(|e| match e {
                InteractionEvent::KeyPress { delay_before, .. } => Some(*delay_before),
                _ => None,
            })
            .collect()
    }

    /// Text typed by the profile
    pub fn typed_text(&self) -> String {
        self.events
            .iter()
            .filter_map(|e| match e {
                InteractionEvent::KeyPress { ch, .. } => Some(*ch),
                _ => None,
            })
            .collect()
    }

    /// Sum of all declared delays
    pub fn total_delay(&self) -> Duration {
        self.events.iter().map(InteractionEvent::delay_before).sum()
    }

    pub fn signature(&self) -> ProfileSignature {
        ProfileSignature::of(self)
    }
}

/// Produces a profile for a pointer span and a text to type
pub trait ProfileStrategy: Send + Sync {
    fn generate(&self, start: Point, end: Point, text: &str, rng: &mut dyn RngCore) -> InteractionProfile;
}

/// Inclusive millisecond range a delay is drawn from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl DelayRange {
    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    pub fn sample(&self, rng: &mut dyn RngCore) -> Duration {
        if self.max_ms <= self.min_ms {
            return Duration::from_millis(self.min_ms);
        }
        Duration::from_millis(rng.gen_range(self.min_ms..=self.max_ms))
    }

    pub fn is_valid(&self) -> bool {
        self.min_ms <= self.max_ms
    }
}

/// Noiseless automation signature
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotStrategy {
    /// Pointer samples including both endpoints
    pub samples: usize,
    pub step_delay_ms: u64,
    pub key_delay_ms: u64,
}

impl Default for BotStrategy {
    fn default() -> Self {
        Self {
            samples: 21,
            step_delay_ms: 10,
            key_delay_ms: 0,
        }
    }
}

impl ProfileStrategy for BotStrategy {
    fn generate(&self, start: Point, end: Point, text: &str, _rng: &mut dyn RngCore) -> InteractionProfile {
        let intervals = self.samples.max(2) - 1;
        let step_delay = Duration::from_millis(self.step_delay_ms);
        let key_delay = Duration::from_millis(self.key_delay_ms);

        let mut events = Vec::with_capacity(intervals + 1 + text.chars().count());
        for i in 0..=intervals {
            let t = i as f64 / intervals as f64;
            events.push(InteractionEvent::PointerMove {
                x: start.x + (end.x - start.x) * t,
                y: start.y + (end.y - start.y) * t,
                delay_before: step_delay,
            });
        }
        events.extend(text.chars().map(|ch| InteractionEvent::KeyPress {
            ch,
            delay_before: key_delay,
        }));

        InteractionProfile::new(Behavior::Bot, events)
    }
}

/// Noisy, curved, irregularly timed signature
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HumanStrategy {
    /// Pointer samples including both endpoints
    pub samples: usize,
    /// Maximum independent offset per axis, in pixels
    pub jitter_px: i32,
    /// Peak lateral deviation of the arc at the midpoint, in pixels
    pub arc_px: f64,
    pub step_delay: DelayRange,
    pub key_delay: DelayRange,
}

impl Default for HumanStrategy {
    fn default() -> Self {
        Self {
            samples: 51,
            jitter_px: 5,
            arc_px: 50.0,
            step_delay: DelayRange::new(10, 50),
            key_delay: DelayRange::new(50, 150),
        }
    }
}

impl ProfileStrategy for HumanStrategy {
    fn generate(&self, start: Point, end: Point, text: &str, rng: &mut dyn RngCore) -> InteractionProfile {
        let intervals = self.samples.max(2) - 1;
        let (dx, dy) = (end.x - start.x, end.y - start.y);
        let length = (dx * dx + dy * dy).sqrt();
        // Unit normal of the span; a degenerate span gets no arc.
        let (nx, ny) = if length > 0.0 {
            (-dy / length, dx / length)
        } else {
            (0.0, 0.0)
        };
        let jitter = self.jitter_px.saturating_abs();

        let mut events = Vec::with_capacity(intervals + 1 + text.chars().count());
        for i in 0..=intervals {
            let t = i as f64 / intervals as f64;
            let arc = (t * PI).sin() * self.arc_px;
            let jx = rng.gen_range(-jitter..=jitter) as f64;
            let jy = rng.gen_range(-jitter..=jitter) as f64;
            events.push(InteractionEvent::PointerMove {
                x: start.x + dx * t + nx * arc + jx,
                y: start.y + dy * t + ny * arc + jy,
                delay_before: self.step_delay.sample(rng),
            });
        }
        for ch in text.chars() {
            events.push(InteractionEvent::KeyPress {
                ch,
                delay_before: self.key_delay.sample(rng),
            });
        }

        InteractionProfile::new(Behavior::Human, events)
    }
}

/// Parameters for both strategies
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileSettings {
    pub bot: BotStrategy,
    pub human: HumanStrategy,
}

/// Statistics a detector can classify a profile on
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfileSignature {
    pub pointer_samples: usize,
    /// Largest perpendicular distance from the first→last chord, in pixels
    pub max_deviation: f64,
    pub mean_deviation: f64,
    /// Variance of pointer step delays, in ms²
    pub step_delay_variance: f64,
    pub key_interval_mean: f64,
    /// Variance of key delays, in ms²
    pub key_interval_variance: f64,
}

impl ProfileSignature {
    pub fn of(profile: &InteractionProfile) -> Self {
        let path = profile.pointer_path();
        let deviations = chord_deviations(&path);
        let max_deviation = deviations.iter().cloned().fold(0.0, f64::max);
        let mean_deviation = mean(&deviations);

        let step_delays = as_millis(&profile.pointer_delays());
        let key_delays = as_millis(&profile.key_delays());

        Self {
            pointer_samples: path.len(),
            max_deviation,
            mean_deviation,
            step_delay_variance: variance(&step_delays),
            key_interval_mean: mean(&key_delays),
            key_interval_variance: variance(&key_delays),
        }
    }
}

fn chord_deviations(path: &[Point]) -> Vec<f64> {
    let (Some(first), Some(last)) = (path.first(), path.last()) else {
        return Vec::new();
    };
    // Line through first and last: a*x + b*y + c = 0
    let a = first.y - last.y;
    let b = last.x - first.x;
    let c = first.x * last.y - last.x * first.y;
    let norm = (a * a + b * b).sqrt();

    path.iter()
        .map(|p| {
            if norm == 0.0 {
                ((p.x - first.x).powi(2) + (p.y - first.y).powi(2)).sqrt()
            } else {
                (a * p.x + b * p.y + c).abs() / norm
            }
        })
        .collect()
}

fn as_millis(delays: &[Duration]) -> Vec<f64> {
    delays.iter().map(|d| d.as_secs_f64() * 1000.0).collect()
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const START: Point = Point::new(100.0, 100.0);
    const END: Point = Point::new(500.0, 500.0);

    #[test]
    fn test_bot_profile_shape() {
        let mut rng = StdRng::seed_from_u64(1);
        let profile = BotStrategy::default().generate(START, END, "I am a robot", &mut rng);

        let path = profile.pointer_path();
        assert_eq!(path.len(), 21);
        assert_eq!(path[0], START);
        assert_eq!(path[20], END);
        assert_eq!(path[10], Point::new(300.0, 300.0));
        assert_eq!(profile.typed_text(), "I am a robot");
        assert!(profile.key_delays().iter().all(|d| d.is_zero()));
        assert!(profile
            .pointer_delays()
            .iter()
            .all(|d| *d == Duration::from_millis(10)));
    }

    #[test]
    fn test_bot_profile_ignores_rng() {
        let a = BotStrategy::default().generate(START, END, "x", &mut StdRng::seed_from_u64(1));
        let b = BotStrategy::default().generate(START, END, "x", &mut StdRng::seed_from_u64(2));
        assert_eq!(a, b);
    }

    #[test]
    fn test_human_profile_reproducible_with_seed() {
        let strategy = HumanStrategy::default();
        let a = strategy.generate(START, END, "I am a human", &mut StdRng::seed_from_u64(7));
        let b = strategy.generate(START, END, "I am a human", &mut StdRng::seed_from_u64(7));
        let c = strategy.generate(START, END, "I am a human", &mut StdRng::seed_from_u64(8));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_human_delays_within_ranges() {
        let strategy = HumanStrategy::default();
        let profile = strategy.generate(START, END, "I am a human", &mut StdRng::seed_from_u64(3));

        assert_eq!(profile.pointer_path().len(), 51);
        for d in profile.pointer_delays() {
            assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(50));
        }
        for d in profile.key_delays() {
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_human_arc_is_perpendicular_to_span() {
        let strategy = HumanStrategy {
            jitter_px: 0,
            ..Default::default()
        };
        let horizontal = strategy.generate(
            Point::new(0.0, 0.0),
            Point::new(100.0, 0.0),
            "",
            &mut StdRng::seed_from_u64(0),
        );
        let mid = horizontal.pointer_path()[25];
        assert!((mid.x - 50.0).abs() < 1e-9);
        assert!((mid.y.abs() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_degenerate_span_has_no_arc() {
        let strategy = HumanStrategy {
            jitter_px: 0,
            ..Default::default()
        };
        let profile = strategy.generate(START, START, "", &mut StdRng::seed_from_u64(0));
        assert!(profile.pointer_path().iter().all(|p| *p == START));
    }

    #[test]
    fn test_negative_jitter_is_treated_as_magnitude() {
        let strategy = HumanStrategy {
            samples: 5,
            jitter_px: i32::MIN,
            ..Default::default()
        };
        let profile = strategy.generate(START, END, "", &mut StdRng::seed_from_u64(0));
        assert_eq!(profile.pointer_path().len(), 5);

        let strategy = HumanStrategy {
            samples: 200,
            jitter_px: -3,
            arc_px: 0.0,
            ..Default::default()
        };
        let profile = strategy.generate(START, START, "", &mut StdRng::seed_from_u64(1));
        for p in profile.pointer_path() {
            assert!((p.x - START.x).abs() <= 3.0 && (p.y - START.y).abs() <= 3.0);
        }
    }

    #[test]
    fn test_signature_of_straight_line_is_flat() {
        let profile = BotStrategy::default().generate(START, END, "abc", &mut StdRng::seed_from_u64(0));
        let sig = profile.signature();
        assert_eq!(sig.pointer_samples, 21);
        assert!(sig.max_deviation < 1e-9);
        assert_eq!(sig.step_delay_variance, 0.0);
        assert_eq!(sig.key_interval_variance, 0.0);
        assert_eq!(sig.key_interval_mean, 0.0);
    }

    #[test]
    fn test_delay_range_collapsed() {
        let range = DelayRange::new(20, 20);
        assert_eq!(range.sample(&mut StdRng::seed_from_u64(0)), Duration::from_millis(20));
        assert!(!DelayRange::new(5, 1).is_valid());
    }

    #[test]
    fn test_behavior_parse() {
        assert_eq!("Bot".parse::<Behavior>().unwrap(), Behavior::Bot);
        assert_eq!("human".parse::<Behavior>().unwrap(), Behavior::Human);
        assert!("robot".parse::<Behavior>().is_err());
    }
}
