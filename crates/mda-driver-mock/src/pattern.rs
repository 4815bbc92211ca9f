//! Synthetic specimen images for the simulated camera.

/// Simple pseudo-random number generator (LCG) for reproducible noise.
/// Uses the same algorithm as glibc for predictable cross-platform behavior.
#[inline]
fn prng(seed: u64) -> u64 {
    seed.wrapping_mul(1103515245).wrapping_add(12345) & 0x7fffffff
}

/// Parameters of one synthetic image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PatternParams {
    /// Sequence number of the image, seeds the noise.
    pub frame_num: u64,
    /// Distance of the focus from the specimen plane, in µm.
    pub defocus_um: f64,
    /// Relative brightness of the channel, 1.0 is nominal.
    pub brightness: f64,
}

/// Render a field of blurred point sources.
///
/// Sources sit on a regular lattice. Their width grows and their peak
/// intensity drops with `|defocus_um|`, so a Z stack through the specimen
/// plane shows a visible focus maximum. Shot-like noise varies per frame.
pub fn generate_test_pattern(width: u32, height: u32, params: PatternParams) -> Vec<u16> {
    let w = width as usize;
    let h = height as usize;
    let mut buffer = vec![0u16; w * h];
    if w == 0 || h == 0 {
        return buffer;
    }

    let background = 400.0;
    let spacing = (width.min(height) / 4).max(4) as f64;
    let sigma = 1.5 + 0.4 * params.defocus_um.abs();
    let peak = 20_000.0 * params.brightness.max(0.0) * (1.5 / sigma).powi(2);
    let two_sigma_sq = 2.0 * sigma * sigma;
    let frame_seed = params.frame_num.wrapping_mul(2654435761);

    for y in 0..h {
        for x in 0..w {
            let idx = y * w + x;

            // distance to the nearest lattice point
            let dx = (x as f64 + spacing / 2.0) % spacing - spacing / 2.0;
            let dy = (y as f64 + spacing / 2.0) % spacing - spacing / 2.0;
            let signal = peak * (-(dx * dx + dy * dy) / two_sigma_sq).exp();

            let noise = (prng(frame_seed ^ idx as u64) & 0x1FF) as f64 - 256.0;
            let value = (background + signal + noise).clamp(0.0, 65535.0);
            buffer[idx] = value as u16;
        }
    }
    buffer
}
