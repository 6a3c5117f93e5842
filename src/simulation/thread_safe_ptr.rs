/**
 * Raw pointer that may cross into rayon workers. Only used by colored
 * projections, where every worker writes a disjoint set of elements.
 */
#[derive(Copy, Clone)]
pub struct ThreadSafeMutPtr<T> {
    ptr: *mut T,
}
unsafe impl<T> Sync for ThreadSafeMutPtr<T> {}
unsafe impl<T> Send for ThreadSafeMutPtr<T> {}
impl<T> ThreadSafeMutPtr<T> {
    pub fn new(ptr: *mut T) -> ThreadSafeMutPtr<T> {
        ThreadSafeMutPtr { ptr }
    }

    /**
     * # Safety
     * `idx` must be in bounds of the allocation and no other thread may access
     * element `idx` while the returned reference lives.
     */
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self, idx: usize) -> &mut T {
        &mut *self.ptr.add(idx)
    }
}
