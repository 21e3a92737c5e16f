//! Perlin and octaves noise generators, in two dimensions.

use glam::DVec2;

use super::SeededRandom;


/// A 2D Perlin noise generator.
#[derive(Debug, Clone)]
pub struct PerlinNoise {
    /// All permutations used by Perlin noise algorithm.
    permutations: Box<[u16; 512]>,
    /// Offset applied to all position given to the generator.
    offset: DVec2,
}

impl PerlinNoise {

    /// Create a new perlin noise initialized with the given RNG.
    pub fn new(rand: &mut SeededRandom) -> Self {

        let offset = rand.next_dvec2() * 256.0;
        let mut permutations = Box::new(std::array::from_fn::<u16, 512, _>(|i| {
            if i < 256 {
                i as u16
            } else {
                0
            }
        }));

        for index in 0usize..256 {
            let permutation_index = rand.next_int_bounded(256 - index as i32) as usize + index;
            permutations.swap(index, permutation_index);
            permutations[index + 256] = permutations[index];
        }

        Self {
            permutations,
            offset,
        }

    }

    /// Get the noise value at given 2D coordinates, roughly in `-1.0..=1.0`.
    pub fn sample(&self, pos: DVec2) -> f64 {

        let mut pos = pos + self.offset;
        let pos_floor = pos.floor();
        pos -= pos_floor;
        let factor = pos * pos * pos * (pos * (pos * 6.0 - 15.0) + 10.0);

        let x_index = (pos_floor.x as i64 & 255) as usize;
        let y_index = (pos_floor.y as i64 & 255) as usize;

        let a = self.permutations[x_index] as usize + y_index;
        let b = self.permutations[x_index + 1] as usize + y_index;

        lerp(factor.y,
            lerp(factor.x,
                grad(self.permutations[a], pos),
                grad(self.permutations[b], pos - DVec2::new(1.0, 0.0))),
            lerp(factor.x,
                grad(self.permutations[a + 1], pos - DVec2::new(0.0, 1.0)),
                grad(self.permutations[b + 1], pos - DVec2::new(1.0, 1.0))))

    }

}

#[inline]
fn lerp(factor: f64, from: f64, to: f64) -> f64 {
    from + factor * (to - from)
}

#[inline]
fn grad(value: u16, pos: DVec2) -> f64 {
    match value & 7 {
        0 => pos.x + pos.y,
        1 => -pos.x + pos.y,
        2 => pos.x - pos.y,
        3 => -pos.x - pos.y,
        4 => pos.x,
        5 => -pos.x,
        6 => pos.y,
        _ => -pos.y,
    }
}


/// A Perlin-based octave noise generator, each octave has half the amplitude and twice
/// the frequency of the previous one.
#[derive(Debug, Clone)]
pub struct OctaveNoise {
    /// Collection of generators for the different octaves.
    generators: Box<[PerlinNoise]>,
}

impl OctaveNoise {

    /// Create a new Perlin-based octaves noise generator.
    pub fn new(rand: &mut SeededRandom, octaves: usize) -> Self {
        Self {
            generators: (0..octaves)
                .map(move |_| PerlinNoise::new(rand))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
        }
    }

    /// Create a new octaves noise generator from its own seed.
    pub fn new_seeded(seed: i64, octaves: usize) -> Self {
        Self::new(&mut SeededRandom::new(seed), octaves)
    }

    /// Number of octaves in this generator.
    #[inline]
    pub fn octaves(&self) -> usize {
        self.generators.len()
    }

    /// Get the noise value at given 2D coordinates.
    pub fn sample(&self, pos: DVec2) -> f64 {
        let mut ret = 0.0;
        let mut freq = 1.0;
        for generator in &self.generators[..] {
            ret += generator.sample(pos * freq) / freq;
            freq *= 2.0;
        }
        ret
    }

    /// Get the noise value normalized by the maximum amplitude of all octaves, the
    /// result is therefore roughly in `-1.0..=1.0`.
    pub fn sample_normalized(&self, pos: DVec2) -> f64 {
        // Sum of 1 + 1/2 + 1/4...
        let amplitude = 2.0 - 1.0 / (1u64 << (self.octaves().max(1) - 1)) as f64;
        self.sample(pos) / amplitude
    }

}


#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn noise_deterministic() {
        let a = OctaveNoise::new_seeded(1234, 4);
        let b = OctaveNoise::new_seeded(1234, 4);
        for i in 0..64 {
            let pos = DVec2::new(i as f64 * 0.37, -(i as f64) * 0.11);
            assert_eq!(a.sample(pos).to_bits(), b.sample(pos).to_bits());
        }
    }

    #[test]
    fn noise_different_seeds() {
        let a = OctaveNoise::new_seeded(1, 4);
        let b = OctaveNoise::new_seeded(2, 4);
        let differ = (0..64)
            .map(|i| DVec2::new(i as f64 * 0.53, 0.25))
            .any(|pos| a.sample(pos) != b.sample(pos));
        assert!(differ);
    }

    #[test]
    fn normalized_in_range() {
        let noise = OctaveNoise::new_seeded(5, 6);
        for i in 0..500 {
            let v = noise.sample_normalized(DVec2::new(i as f64 * 0.173, i as f64 * 0.031));
            assert!(v > -2.0 && v < 2.0, "{v}");
        }
    }

}
