pub mod display;
pub mod knob;
