/// Refined scale-space extremum, positions in the pixel grid of its octave
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub octave: usize,
    /// Integer DoG layer the extremum converged on
    pub layer: usize,
    pub x: f32,
    pub y: f32,
    /// Blur sigma in octave pixels
    pub sigma: f32,
    /// Absolute interpolated DoG value
    pub response: f32,
    /// Radians, image axes with `y` pointing down
    pub orientation: f32,
}

impl Candidate {
    /// Octave pixel to detection pixel factor
    pub fn octave_scale(&self) -> f32 {
        (1usize << self.octave) as f32
    }

    pub fn detection_position(&self) -> (f32, f32) {
        let s = self.octave_scale();
        (self.x * s, self.y * s)
    }

    pub fn detection_sigma(&self) -> f32 {
        self.sigma * self.octave_scale()
    }
}

/// Dimensions of one octave of the scale space
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OctaveLevel {
    pub index: usize,
    pub width: usize,
    pub height: usize,
}
