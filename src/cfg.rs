pub mod atomic {
    #[cfg(not(all(loom, test)))]
    pub use core::sync::atomic::{fence, AtomicBool, AtomicI32, AtomicPtr, AtomicUsize};

    #[cfg(all(loom, test))]
    pub use loom::sync::atomic::{fence, AtomicBool, AtomicI32, AtomicPtr, AtomicUsize};
}

pub mod cell {
    pub use sealed::UnsafeCellWith;

    #[cfg(not(all(loom, test)))]
    pub use core::cell::UnsafeCell;

    #[cfg(all(loom, test))]
    pub use loom::cell::UnsafeCell;

    #[cfg(not(all(loom, test)))]
    impl<T: ?Sized> UnsafeCellWith<T> for UnsafeCell<T> {
        unsafe fn with_unchecked<F, Ret>(&self, f: F) -> Ret
        where
            F: FnOnce(&T) -> Ret,
        {
            // SAFETY: Caller must guarantee there are no mutable aliases.
            f(unsafe { &*self.get() })
        }

        unsafe fn with_mut_unchecked<F, Ret>(&self, f: F) -> Ret
        where
            F: FnOnce(&mut T) -> Ret,
        {
            // SAFETY: Caller must guarantee there are no other aliases.
            f(unsafe { &mut *self.get() })
        }
    }

    #[cfg(all(loom, test))]
    impl<T: ?Sized> UnsafeCellWith<T> for UnsafeCell<T> {
        unsafe fn with_unchecked<F, Ret>(&self, f: F) -> Ret
        where
            F: FnOnce(&T) -> Ret,
        {
            // SAFETY: Caller must guarantee there are no mutable aliases.
            self.with(|ptr| f(unsafe { &*ptr }))
        }

        unsafe fn with_mut_unchecked<F, Ret>(&self, f: F) -> Ret
        where
            F: FnOnce(&mut T) -> Ret,
        {
            // SAFETY: Caller must guarantee there are no other aliases.
            self.with_mut(|ptr| f(unsafe { &mut *ptr }))
        }
    }

    mod sealed {
        /// A trait that extends [`UnsafeCell`] to allow running closures against
        /// its underlying data.
        pub trait UnsafeCellWith<T: ?Sized> {
            /// Runs `f` against a shared reference borrowed from a [`UnsafeCell`].
            ///
            /// # Safety
            ///
            /// Caller must guarantee there are no mutable aliases to the
            /// underlying data.
            unsafe fn with_unchecked<F, Ret>(&self, f: F) -> Ret
            where
                F: FnOnce(&T) -> Ret;

            /// Runs `f` against a mutable reference borrowed from a [`UnsafeCell`].
            ///
            /// # Safety
            ///
            /// Caller must guarantee there are no other aliases to the
            /// underlying data.
            unsafe fn with_mut_unchecked<F, Ret>(&self, f: F) -> Ret
            where
                F: FnOnce(&mut T) -> Ret;
        }
    }
}

pub mod hint {
    #[cfg(not(all(loom, test)))]
    pub use core::hint::spin_loop;

    #[cfg(all(loom, test))]
    pub use loom::hint::spin_loop;
}

pub mod sync {
    #[cfg(not(all(loom, test)))]
    pub use std::sync::Arc;

    #[cfg(all(loom, test))]
    pub use loom::sync::Arc;
}

pub mod thread {
    #[cfg(not(all(loom, test)))]
    pub use std::thread::{current, park, park_timeout, yield_now, Thread};

    #[cfg(not(all(loom, test)))]
    pub use std::thread_local;

    #[cfg(all(loom, test))]
    pub use loom::thread::{current, park, yield_now, Thread};

    #[cfg(all(loom, test))]
    pub use loom::thread_local;

    /// Loom can't model timeouts. Parking is allowed to return spuriously, so
    /// a timed park is modelled as a yield back to the scheduler.
    #[cfg(all(loom, test))]
    pub fn park_timeout(_dur: std::time::Duration) {
        loom::thread::yield_now();
    }
}
