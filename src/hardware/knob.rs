use crate::types::Tick;

/// Quadrature steps between two detents.
const STEPS_PER_DETENT: i8 = 4;

// Indexed by (previous << 2) | current, each a 2-bit (A, B) sample.
// +1 is clockwise (A leads B), 0 is no movement or an impossible jump.
const TRANSITIONS: [i8; 16] = [0, -1, 1, 0, 1, 0, 0, -1, -1, 0, 0, 1, 0, 1, -1, 0];

/// Both lines high; where the knob rests between clicks.
const REST: u8 = 0b11;

/// Turns raw A/B samples into one tick per detent.
#[derive(Debug, Clone)]
pub struct QuadratureDecoder {
    previous: u8,
    steps: i8,
}

impl Default for QuadratureDecoder {
    fn default() -> Self {
        Self {
            previous: REST,
            steps: 0,
        }
    }
}

impl QuadratureDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, a: bool, b: bool) -> Option<Tick> {
        let current = ((a as u8) << 1) | b as u8;
        if current == self.previous {
            return None;
        }
        self.steps += TRANSITIONS[((self.previous << 2) | current) as usize];
        self.previous = current;

        if current != REST {
            return None;
        }
        let steps = std::mem::take(&mut self.steps);
        if steps >= STEPS_PER_DETENT {
            Some(Tick::Right)
        } else if steps <= -STEPS_PER_DETENT {
            Some(Tick::Left)
        } else {
            None
        }
    }
}

#[cfg(target_os = "espidf")]
pub use device::{Knob, KnobError};

#[cfg(target_os = "espidf")]
mod device {
    use super::QuadratureDecoder;
    use crate::types::Tick;
    use esp_idf_svc::hal::gpio::{AnyIOPin, Input, PinDriver, Pull};
    use log::info;

    #[derive(Debug)]
    pub enum KnobError {
        GpioError(String),
    }

    impl std::fmt::Display for KnobError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                KnobError::GpioError(msg) => write!(f, "GPIO error: {}", msg),
            }
        }
    }

    impl std::error::Error for KnobError {}

    pub struct Knob {
        a: PinDriver<'static, AnyIOPin, Input>,
        b: PinDriver<'static, AnyIOPin, Input>,
        decoder: QuadratureDecoder,
    }

    fn input(pin: AnyIOPin) -> Result<PinDriver<'static, AnyIOPin, Input>, KnobError> {
        let mut driver = PinDriver::input(pin)
            .map_err(|e| KnobError::GpioError(format!("Failed to configure input: {:?}", e)))?;
        driver
            .set_pull(Pull::Up)
            .map_err(|e| KnobError::GpioError(format!("Failed to enable pull-up: {:?}", e)))?;
        Ok(driver)
    }

    impl Knob {
        pub fn new(pin_a: AnyIOPin, pin_b: AnyIOPin) -> Result<Self, KnobError> {
            let a = input(pin_a)?;
            let b = input(pin_b)?;
            info!("Rotary encoder initialized on GPIO{} / GPIO{}", a.pin(), b.pin());
            Ok(Self {
                a,
                b,
                decoder: QuadratureDecoder::new(),
            })
        }

        /// Samples both lines once. Call at least every couple of milliseconds.
        pub fn poll(&mut self) -> Option<Tick> {
            self.decoder.update(self.a.is_high(), self.b.is_high())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(decoder: &mut QuadratureDecoder, samples: &[(bool, bool)]) -> Vec<Tick> {
        samples.iter().filter_map(|(a, b)| decoder.update(*a, *b)).collect()
    }

    const CLOCKWISE: [(bool, bool); 4] = [(false, true), (false, false), (true, false), (true, true)];
    const COUNTER_CLOCKWISE: [(bool, bool); 4] = [(true, false), (false, false), (false, true), (true, true)];

    #[test]
    fn test_one_tick_per_detent() {
        let mut decoder = QuadratureDecoder::new();
        assert_eq!(feed(&mut decoder, &CLOCKWISE), vec![Tick::Right]);
        assert_eq!(feed(&mut decoder, &COUNTER_CLOCKWISE), vec![Tick::Left]);
    }

    #[test]
    fn test_repeated_samples_are_ignored() {
        let mut decoder = QuadratureDecoder::new();
        let samples = [
            (true, true),
            (false, true),
            (false, true),
            (false, false),
            (true, false),
            (true, false),
            (true, true),
        ];
        assert_eq!(feed(&mut decoder, &samples), vec![Tick::Right]);
    }

    #[test]
    fn test_contact_bounce_yields_nothing() {
        let mut decoder = QuadratureDecoder::new();
        let samples = [(false, true), (true, true), (false, true), (true, true)];
        assert!(feed(&mut decoder, &samples).is_empty());
    }

    #[test]
    fn test_half_turn_and_back() {
        let mut decoder = QuadratureDecoder::new();
        let samples = [(false, true), (false, false), (false, true), (true, true)];
        assert!(feed(&mut decoder, &samples).is_empty());
        assert_eq!(feed(&mut decoder, &CLOCKWISE), vec![Tick::Right]);
    }
}
