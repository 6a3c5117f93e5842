use crate::{floating_type_mod::FT, proxy::ProxyId, SolverError, V3};
use nalgebra::zero;

macro_rules! decl_particle_vec {
    (pub struct $struct_name:ident { $(pub $field_name:ident: Vec<$field_type:ty> | $default_value:expr),*$(,)?  }) => {
        pub struct $struct_name {
            $(
                pub $field_name : Vec<$field_type>,
            )*
        }

        impl $struct_name {
            pub fn truncate(&mut self, len: usize) {
                $(
                    self.$field_name.truncate(len);
                )*
            }

            pub fn try_reserve(&mut self, additional: usize) -> Result<(), std::collections::TryReserveError> {
                $(
                    self.$field_name.try_reserve(additional)?;
                )*
                Ok(())
            }

            pub fn extend(&mut self, num_elements: usize) {
                $(
                    self.$field_name.extend((0..num_elements).map::<$field_type, _>(|_| $default_value));
                )*
            }

            /** Erases `[start, start + count)` and shifts every later element down by `count`. */
            pub fn remove_range(&mut self, start: usize, count: usize) {
                $(
                    self.$field_name.drain(start..start + count);
                )*
            }

            pub fn default(len: usize) -> Self {
                Self {
                    $(
                        $field_name: (0..len).map(|_| $default_value).collect::<Vec<$field_type>>(),
                    )*
                }
            }
        }
    }
}

decl_particle_vec! {
    pub struct ParticleVec {
        // committed position at the start of the current sub-step
        pub x: Vec<V3> | zero(),
        // predicted position, mutated by constraints
        pub p: Vec<V3> | zero(),
        pub v: Vec<V3> | zero(),

        pub m: Vec<FT> | 0.,
        // zero for kinematic particles
        pub inv_m: Vec<FT> | 0.,

        pub damping: Vec<FT> | 0.,
        pub gravity_scale: Vec<FT> | 1.,

        pub owner: Vec<Option<ProxyId>> | None,
    }
}

impl ParticleVec {
    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    pub fn is_kinematic(&self, i: usize) -> bool {
        self.inv_m[i] == 0.
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParticleRange {
    pub start: usize,
    pub count: usize,
}

impl ParticleRange {
    pub fn end(&self) -> usize {
        self.start + self.count
    }

    pub fn contains(&self, i: usize) -> bool {
        i >= self.start && i < self.end()
    }

    pub fn indices(&self) -> std::ops::Range<usize> {
        self.start..self.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeRemap {
    pub old_start: usize,
    pub new_start: usize,
}

/**
 * Dense particle storage handing out contiguous ranges.
 *
 * Indices are only stable between two calls to `remove_range`. Every removal
 * bumps `generation`, which constraint families record when they are built and
 * check before touching particle memory.
 */
pub struct ParticleStore {
    pub particles: ParticleVec,
    ranges: Vec<ParticleRange>,
    generation: u64,
}

impl Default for ParticleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ParticleStore {
    pub fn new() -> Self {
        ParticleStore {
            particles: ParticleVec::default(0),
            ranges: Vec::new(),
            generation: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /** Allocated ranges in ascending order of their start index. */
    pub fn ranges(&self) -> &[ParticleRange] {
        &self.ranges
    }

    pub fn add_range(&mut self, count: usize) -> Result<usize, SolverError> {
        let start = self.particles.len();
        self.particles
            .try_reserve(count)
            .map_err(|_| SolverError::Allocation { requested: count })?;
        self.ranges
            .try_reserve(1)
            .map_err(|_| SolverError::Allocation { requested: count })?;
        self.particles.extend(count);
        self.ranges.push(ParticleRange { start, count });
        Ok(start)
    }

    /**
     * Removes the range beginning at `start` and compacts every later range.
     * The returned remaps must be applied to every holder of a range start.
     */
    pub fn remove_range(&mut self, start: usize, count: usize) -> Result<Vec<RangeRemap>, SolverError> {
        let range_idx = self
            .ranges
            .iter()
            .position(|r| r.start == start && r.count == count)
            .ok_or(SolverError::UnknownRange { start })?;

        self.particles.remove_range(start, count);
        self.ranges.remove(range_idx);
        self.generation += 1;

        let mut remaps = Vec::new();
        for range in self.ranges.iter_mut().skip(range_idx) {
            debug_assert!(range.start >= start + count);
            let old_start = range.start;
            range.start -= count;
            remaps.push(RangeRemap {
                old_start,
                new_start: range.start,
            });
        }
        Ok(remaps)
    }

    pub fn clear(&mut self) {
        self.particles.truncate(0);
        self.ranges.clear();
        self.generation += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vec3f;

    fn assert_ranges_tile(store: &ParticleStore) {
        let mut expected_start = 0;
        for range in store.ranges() {
            assert_eq!(range.start, expected_start);
            expected_start = range.end();
        }
        assert_eq!(expected_start, store.len());
    }

    #[test]
    fn add_range_appends() {
        let mut store = ParticleStore::new();
        assert_eq!(store.add_range(4).unwrap(), 0);
        assert_eq!(store.add_range(3).unwrap(), 4);
        assert_eq!(store.len(), 7);
        assert_ranges_tile(&store);
    }

    #[test]
    fn remove_range_compacts_and_reports_remaps() {
        let mut store = ParticleStore::new();
        store.add_range(2).unwrap();
        store.add_range(3).unwrap();
        store.add_range(4).unwrap();
        for i in 0..store.len() {
            store.particles.x[i] = vec3f(i as FT, 0., 0.);
        }

        let remaps = store.remove_range(2, 3).unwrap();
        assert_eq!(
            remaps,
            vec![RangeRemap {
                old_start: 5,
                new_start: 2
            }]
        );
        assert_eq!(store.len(), 6);
        assert_eq!(store.particles.x[2], vec3f(5., 0., 0.));
        assert_eq!(store.generation(), 1);
        assert_ranges_tile(&store);
    }

    #[test]
    fn removing_unknown_range_fails() {
        let mut store = ParticleStore::new();
        store.add_range(2).unwrap();
        assert_eq!(store.remove_range(1, 1), Err(SolverError::UnknownRange { start: 1 }));
        assert_eq!(store.generation(), 0);
    }

    #[test]
    fn new_particles_default_to_dynamic_gravity() {
        let mut store = ParticleStore::new();
        store.add_range(1).unwrap();
        assert_eq!(store.particles.gravity_scale[0], 1.);
        assert!(store.particles.owner[0].is_none());
    }
}
