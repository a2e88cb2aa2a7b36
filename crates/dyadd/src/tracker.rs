//! Stand-in gaze sources for stations without an eye tracker.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use dyad_core::config::GazeSourceKind;
use dyad_services::{GazeSource, RawGaze};

pub fn from_kind(kind: GazeSourceKind, screen: (u32, u32)) -> Box<dyn GazeSource> {
    match kind {
        GazeSourceKind::Synthetic => Box::new(SyntheticGaze::new(screen, rand::random())),
        GazeSourceKind::None => Box::new(NoGaze),
    }
}

/// Never produces a sample.
pub struct NoGaze;

impl GazeSource for NoGaze {
    fn poll_sample(&mut self) -> Option<RawGaze> {
        None
    }
}

/// Slow orbit around the screen centre with jitter and the odd dropout,
/// in centre-origin screen coordinates.
pub struct SyntheticGaze {
    rng: StdRng,
    radius: f64,
    phase: f64,
}

/// Fraction of samples reported invalid, roughly a blink rate.
const DROPOUT: f64 = 0.02;
const JITTER_PX: f64 = 6.0;
const STEP_RAD: f64 = 0.02;

impl SyntheticGaze {
    pub fn new(screen: (u32, u32), seed: u64) -> Self {
        let radius = f64::from(screen.0.min(screen.1)) * 0.25;
        Self {
            rng: StdRng::seed_from_u64(seed),
            radius,
            phase: 0.0,
        }
    }
}

impl GazeSource for SyntheticGaze {
    fn poll_sample(&mut self) -> Option<RawGaze> {
        self.phase = (self.phase + STEP_RAD) % std::f64::consts::TAU;
        if self.rng.gen_bool(DROPOUT) {
            return Some(RawGaze {
                x: 0.0,
                y: 0.0,
                valid: false,
            });
        }
        let jx = self.rng.gen_range(-JITTER_PX..=JITTER_PX);
        let jy = self.rng.gen_range(-JITTER_PX..=JITTER_PX);
        Some(RawGaze {
            x: self.radius * self.phase.cos() + jx,
            y: self.radius * self.phase.sin() + jy,
            valid: true,
        })
    }
}
