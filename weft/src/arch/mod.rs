//! The one assembly boundary in the runtime.
//!
//! `weft_swap_context` saves the callee-saved register set of the running
//! context onto its stack, stores the resulting stack pointer through
//! `save`, then installs `jump` as the stack pointer and restores the
//! registers found there. A stack produced by [`seed_stack`] "restores"
//! into the coroutine trampoline on its first swap.
//!
//! Everything above this module reasons in terms of saved stack pointers;
//! no other code touches registers.

#[cfg(target_arch = "x86_64")]
mod x86_64;

#[cfg(target_arch = "aarch64")]
mod aarch64;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("weft supports only x86_64 and aarch64");

#[cfg(target_arch = "x86_64")]
pub(crate) use x86_64::seed_stack;

#[cfg(target_arch = "aarch64")]
pub(crate) use aarch64::seed_stack;

unsafe extern "C" {
    /// Swap machine contexts.
    ///
    /// # Safety
    /// `save` must point to writable storage for the outgoing stack
    /// pointer. `jump` must be a stack pointer previously written by this
    /// function or produced by [`seed_stack`], and its stack must still be
    /// mapped. The call returns only when some other context swaps back.
    pub(crate) fn weft_swap_context(save: *mut *mut u8, jump: *mut u8);
}
