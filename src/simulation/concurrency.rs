pub use internal::*;

#[cfg(target_arch = "wasm32")]
mod internal {
    pub fn par_for_each_index<F: Fn(usize) + Send + Sync>(indices: &[usize], f: F) {
        indices.iter().for_each(|&idx| {
            f(idx);
        });
    }

    pub fn par_iter_mut2<T1: Send + Sync, T2: Send + Sync, F: Fn(usize, &mut T1, &mut T2) + Send + Sync>(
        arr1: &mut [T1],
        arr2: &mut [T2],
        f: F,
    ) {
        arr1.iter_mut()
            .zip(arr2.iter_mut())
            .enumerate()
            .for_each(|(idx, (v1, v2))| {
                f(idx, v1, v2);
            });
    }
}

#[cfg(not(target_arch = "wasm32"))]
mod internal {
    use rayon::prelude::*;

    /** Calls `f` for every listed index; callers guarantee the indices touch disjoint data. */
    pub fn par_for_each_index<F: Fn(usize) + Send + Sync>(indices: &[usize], f: F) {
        indices.par_iter().for_each(|&idx| {
            f(idx);
        });
    }

    pub fn par_iter_mut2<T1: Send + Sync, T2: Send + Sync, F: Fn(usize, &mut T1, &mut T2) + Send + Sync>(
        arr1: &mut [T1],
        arr2: &mut [T2],
        f: F,
    ) {
        arr1.par_iter_mut()
            .zip(arr2.par_iter_mut())
            .enumerate()
            .for_each(|(idx, (v1, v2))| {
                f(idx, v1, v2);
            });
    }
}
