//! System V x86_64 context switch.
//!
//! Only the callee-saved registers and the stack pointer travel with a
//! context; everything else is dead across the `weft_swap_context` call
//! boundary because the compiler treats it as an ordinary C call.

use std::arch::global_asm;
use std::ptr;

// rdi = save (*mut *mut u8), rsi = jump (*mut u8).
//
// The saved frame layout, from the stored stack pointer upward:
//   [sp + 0]  r15
//   [sp + 8]  r14
//   [sp + 16] r13
//   [sp + 24] r12
//   [sp + 32] rbx
//   [sp + 40] rbp
//   [sp + 48] return address
global_asm!(
    ".global weft_swap_context",
    "weft_swap_context:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, rsi",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
);

/// Write an initial frame onto a fresh stack so that the first swap into
/// it "returns" into `entry`.
///
/// `top` is the high end of the stack and must be 16-byte aligned.
/// The frame places `entry` where `ret` will find it and zeroes the six
/// callee-saved slots; `entry` therefore starts with `rsp % 16 == 8`,
/// exactly as if it had been `call`ed.
///
/// # Safety
/// `top` must point one-past-the-end of at least 64 writable bytes.
pub(crate) unsafe fn seed_stack(top: *mut u8, entry: extern "C" fn()) -> *mut u8 {
    unsafe {
        // A zero word above the return address stops frame-pointer walkers.
        ptr::write(top.sub(8) as *mut usize, 0);
        ptr::write(top.sub(16) as *mut usize, entry as usize);
        for slot in 1..=6 {
            ptr::write(top.sub(16 + slot * 8) as *mut usize, 0);
        }
        top.sub(64)
    }
}
