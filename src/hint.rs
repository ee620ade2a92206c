cfg_if::cfg_if! {
    if #[cfg(feature = "nightly")] {
        pub(crate) use core::intrinsics::likely;
        pub(crate) use core::intrinsics::unlikely;
    } else {
        #[inline(always)]
        pub(crate) fn likely(b: bool) -> bool {
            b
        }
        #[inline(always)]
        pub(crate) fn unlikely(b: bool) -> bool {
            b
        }
    }
}
