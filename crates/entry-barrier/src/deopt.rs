//! Deoptimization of a Trapped Activation
//!
//! When the slow path decides a method must not run, the activation that
//! called into it has already pushed a return address pointing into the
//! method's body. The deoptimizer rewrites the raw stack around that return
//! slot so that, when the entry barrier stub returns, control lands in the
//! wrong-method resolution stub with the caller's registers restored.
//!
//! All stack arithmetic is expressed relative to the return slot through a
//! [`CallingConvention`] descriptor, one per instruction set. The layouts
//! must match what the entry barrier stub saves before calling the runtime.
//!
//! ```text
//! x86_64 (cookie)                       aarch64 / riscv64 (frame record)
//!
//! [ caller's return address ] <- ra+fs     [ sender fp, sender pc ]   <- sender sp - 2
//! [ caller's rbp            ] <- ra+fs-1   [ compiled frame       ]   <- ra+1
//! [ compiled frame slots    ]              [ return address       ]   <- ra
//! [ return address          ] <- ra        [ ...                  ]
//! [ cookie (-1)             ] <- ra-1      [ pc | lr | fp | sp    ]   <- ra-2 .. ra-5
//! [ stub rbp                ] <- ra-2
//! ```

use crate::code::CompiledMethod;
use crate::guarantee;
use serde::Serialize;

/// Value the x86_64 stub stores in the cookie slot
pub const DEOPT_COOKIE: usize = usize::MAX;

/// Stack layout around the return slot, in machine words
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallingConvention {
    /// The stub reserved a cookie slot for the caller's stack pointer and
    /// saved its own frame pointer below it. On the way out the stub pops
    /// rbp, loads rsp from the cookie and jumps through the caller's rbp
    /// slot.
    Cookie {
        stub_fp_slot: isize,
        cookie_slot: isize,
    },
    /// The stub reserved a `{sp, fp, lr, pc}` record that it reloads
    /// before jumping to `pc`.
    FrameRecord {
        record_slot: isize,
        /// Compiled frame's stack pointer relative to the return slot
        compiled_sp_slot: isize,
        /// Saved frame pointer relative to the sender's stack pointer
        sender_fp_slot: isize,
        /// Saved return address relative to the sender's stack pointer
        sender_pc_slot: isize,
    },
}

impl CallingConvention {
    pub const fn x86_64() -> Self {
        CallingConvention::Cookie {
            stub_fp_slot: -2,
            cookie_slot: -1,
        }
    }

    pub const fn aarch64() -> Self {
        CallingConvention::FrameRecord {
            record_slot: -5,
            compiled_sp_slot: 1,
            sender_fp_slot: -2,
            sender_pc_slot: -1,
        }
    }

    pub const fn riscv64() -> Self {
        Self::aarch64()
    }
}

/// Caller state restored by a rewritten frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameRewrite {
    pub sender_sp: usize,
    pub sender_fp: usize,
    pub resume_pc: usize,
}

/// Rewrites trapped activations to return into the resolution stub
#[derive(Debug, Clone, Copy)]
pub struct Deoptimizer {
    convention: CallingConvention,
    wrong_method_stub: usize,
}

impl Deoptimizer {
    pub fn new(convention: CallingConvention, wrong_method_stub: usize) -> Self {
        Self {
            convention,
            wrong_method_stub,
        }
    }

    pub fn convention(&self) -> CallingConvention {
        self.convention
    }

    /// Address written as the new continuation
    pub fn wrong_method_stub(&self) -> usize {
        self.wrong_method_stub
    }

    /// Rewrite the frame around `return_slot` so the stub returns into the
    /// wrong-method stub instead of `cm`'s body
    ///
    /// # Safety
    ///
    /// `return_slot` must be the return-address slot of a live activation
    /// of `cm` that called the entry barrier stub, laid out per
    /// [`Self::convention`], and every slot the convention touches must be
    /// writable by the caller for the duration of the call.
    pub unsafe fn deoptimize(&self, cm: &CompiledMethod, return_slot: *mut usize) -> FrameRewrite {
        guarantee!(
            !cm.is_osr(),
            "OSR method {} must be entrant after migration",
            cm.name()
        );
        let frame_size = cm.frame_size_words() as isize;

        let rewrite = match self.convention {
            CallingConvention::Cookie {
                stub_fp_slot,
                cookie_slot,
            } => {
                guarantee!(
                    frame_size >= 2,
                    "frame of {} has {} words, no room for return address and rbp",
                    cm.name(),
                    frame_size
                );
                let stub_fp = return_slot.offset(stub_fp_slot);
                let cookie = return_slot.offset(cookie_slot);
                let callers_sp = return_slot.offset(frame_size);
                let callers_fp = callers_sp.offset(-1);

                guarantee!(
                    cookie.read() == DEOPT_COOKIE,
                    "cookie slot {:p} holds {:#x}",
                    cookie,
                    cookie.read()
                );

                let sender_fp = callers_fp.read();
                // Stub pops the caller's rbp from its own saved slot
                stub_fp.write(sender_fp);
                // and restores rsp from the cookie
                cookie.write(callers_sp as usize);
                // then jumps through the slot that held the caller's rbp
                callers_fp.write(self.wrong_method_stub);

                FrameRewrite {
                    sender_sp: callers_sp as usize,
                    sender_fp,
                    resume_pc: callers_sp.read(),
                }
            }
            CallingConvention::FrameRecord {
                record_slot,
                compiled_sp_slot,
                sender_fp_slot,
                sender_pc_slot,
            } => {
                let compiled_sp = return_slot.offset(compiled_sp_slot);
                let sender_sp = compiled_sp.offset(frame_size);
                let sender_fp = sender_sp.offset(sender_fp_slot).read();
                let sender_pc = sender_sp.offset(sender_pc_slot).read();

                let record = return_slot.offset(record_slot);
                record.write(sender_sp as usize);
                record.offset(1).write(sender_fp);
                record.offset(2).write(sender_pc);
                record.offset(3).write(self.wrong_method_stub);

                FrameRewrite {
                    sender_sp: sender_sp as usize,
                    sender_fp,
                    resume_pc: sender_pc,
                }
            }
        };

        log::debug!(
            "deoptimized {} (id {}): sender sp {:#x}, fp {:#x}, pc {:#x}",
            cm.name(),
            cm.id(),
            rewrite.sender_sp,
            rewrite.sender_fp,
            rewrite.resume_pc
        );

        rewrite
    }
}
