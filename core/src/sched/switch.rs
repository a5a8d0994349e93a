//! Low-level context switching using naked functions with compile-time
//! struct offsets.
//!
//! The scheduler treats a virtual processor's saved register state as a
//! `SwitchContext`: the callee-saved registers plus stack pointer and
//! RFLAGS. Switching is a cooperative software switch: the caller has
//! already updated all scheduler bookkeeping, this module only moves the
//! CPU from one saved frame to the other.

use core::arch::naked_asm;
use core::ffi::c_void;
use core::mem::offset_of;

/// Saved register state of a suspended virtual processor.
///
/// Layout is read by the assembly in [`switch_registers`]; every field
/// offset is verified below.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SwitchContext {
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub rflags: u64,
    pub rip: u64,
}

impl SwitchContext {
    pub const fn zero() -> Self {
        Self {
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rbp: 0,
            rsp: 0,
            rflags: 0x202,
            rip: 0,
        }
    }
}

const _: () = assert!(core::mem::size_of::<SwitchContext>() == 72);

const _: () = {
    assert!(offset_of!(SwitchContext, rbx) == 0);
    assert!(offset_of!(SwitchContext, r12) == 8);
    assert!(offset_of!(SwitchContext, r13) == 16);
    assert!(offset_of!(SwitchContext, r14) == 24);
    assert!(offset_of!(SwitchContext, r15) == 32);
    assert!(offset_of!(SwitchContext, rbp) == 40);
    assert!(offset_of!(SwitchContext, rsp) == 48);
    assert!(offset_of!(SwitchContext, rflags) == 56);
    assert!(offset_of!(SwitchContext, rip) == 64);
};

/// Entry closure signature for a virtual processor.
pub type EntryFn = extern "C" fn(*mut c_void);

/// Low-level register switch between two contexts.
///
/// Saves the callee-saved registers to `prev` and loads them from `next`.
/// The `ret` at the end pops the resume address from the new stack, so a
/// freshly seeded context must have its trampoline address stored at the
/// top of its stack (see `vp_set_closure`).
///
/// # Safety
///
/// - Both contexts must be valid; `next` must have been seeded or saved here
/// - Must be called with preemption disabled
/// - `prev` may be null only for the incipient switch out of the boot path
#[unsafe(naked)]
pub extern "sysv64" fn switch_registers(prev: *mut SwitchContext, next: *const SwitchContext) {
    naked_asm!(
        // rdi = prev context pointer
        // rsi = next context pointer
        "test rdi, rdi",
        "jz 2f",

        // Save callee-saved registers to prev context
        "mov [rdi + {off_rbx}], rbx",
        "mov [rdi + {off_r12}], r12",
        "mov [rdi + {off_r13}], r13",
        "mov [rdi + {off_r14}], r14",
        "mov [rdi + {off_r15}], r15",
        "mov [rdi + {off_rbp}], rbp",
        "mov [rdi + {off_rsp}], rsp",

        // Save RFLAGS via stack
        "pushfq",
        "pop QWORD PTR [rdi + {off_rflags}]",

        // Record the resume address for diagnostics
        "mov rax, [rsp]",
        "mov [rdi + {off_rip}], rax",

        // Load callee-saved registers from next context
        "2:",
        "mov rbx, [rsi + {off_rbx}]",
        "mov r12, [rsi + {off_r12}]",
        "mov r13, [rsi + {off_r13}]",
        "mov r14, [rsi + {off_r14}]",
        "mov r15, [rsi + {off_r15}]",
        "mov rbp, [rsi + {off_rbp}]",

        "push QWORD PTR [rsi + {off_rflags}]",
        "popfq",

        // Switch stacks; the ret below resumes the new context
        "mov rsp, [rsi + {off_rsp}]",
        "ret",

        off_rbx = const offset_of!(SwitchContext, rbx),
        off_r12 = const offset_of!(SwitchContext, r12),
        off_r13 = const offset_of!(SwitchContext, r13),
        off_r14 = const offset_of!(SwitchContext, r14),
        off_r15 = const offset_of!(SwitchContext, r15),
        off_rbp = const offset_of!(SwitchContext, rbp),
        off_rsp = const offset_of!(SwitchContext, rsp),
        off_rflags = const offset_of!(SwitchContext, rflags),
        off_rip = const offset_of!(SwitchContext, rip),
    );
}

/// First-resume trampoline for a virtual processor.
///
/// `vp_set_closure` seeds the context so that the first switch into a VP
/// lands here with the entry function in r12 and its argument in r13. When
/// the entry function returns, the VP relinquishes itself back to the pool.
#[unsafe(naked)]
pub extern "sysv64" fn vp_entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",

        // Entry returned: hand the VP back to the pool. Never returns.
        "call {relinquish}",
        "ud2",

        relinquish = sym crate::sched::vp::vp_relinquish_entry,
    );
}
