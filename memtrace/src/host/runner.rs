//! Drives one application thread through the host
//!
//! Basic blocks are translated on first execution (the client sees every
//! application instruction once), cached, and then executed from the cache
//! for every iteration.

use std::sync::Arc;

use log::{debug, info};

use super::code_cache::CodeCache;
use super::cpu::{Cpu, ExecStats};
use super::ilist::{InstrHandle, InstrList, Node};
use super::isa::{Instr, Reg};
use super::memory::{AddressSpace, Perms};
use super::thread::ThreadContext;
use super::Host;
use crate::domain::{MemtraceError, ThreadId};

/// Hooks a client registers with the host
pub trait InstrumentationClient: Sync {
    /// Called on the new thread before any of its code runs.
    ///
    /// # Errors
    /// Failing here aborts the thread before execution.
    fn on_thread_start(&self, ctx: &mut ThreadContext) -> Result<(), MemtraceError>;

    /// Insertion event: called once per application instruction `at` while
    /// its block is being translated.
    ///
    /// # Errors
    /// Failing here aborts translation of the block.
    fn instrument(&self, ilist: &mut InstrList, at: InstrHandle) -> Result<(), MemtraceError>;

    /// Called when the thread exits, including after a failed execution.
    ///
    /// # Errors
    /// Reported to whoever runs the thread.
    fn on_thread_end(&self, ctx: &mut ThreadContext) -> Result<(), MemtraceError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock {
    /// Application address of the first instruction
    pub tag: u64,
    pub instrs: Vec<Instr>,
}

/// Straight-line application code: blocks run in order, `iterations` times.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub blocks: Vec<BasicBlock>,
    pub iterations: u64,
    /// Read-write data regions `(base, len)` mapped before start
    pub regions: Vec<(u64, usize)>,
    /// Initial register values
    pub registers: Vec<(Reg, u64)>,
}

impl Program {
    /// Memory operands executed over the whole run
    #[must_use]
    pub fn memory_operand_count(&self) -> u64 {
        let per_iteration: usize = self
            .blocks
            .iter()
            .flat_map(|b| &b.instrs)
            .map(|i| i.srcs.iter().chain(&i.dsts).filter(|op| op.is_memory_reference()).count())
            .sum();
        per_iteration as u64 * self.iterations
    }
}

/// Result of running a thread to completion
pub struct ThreadRun {
    pub id: ThreadId,
    pub stats: ExecStats,
    pub blocks_translated: usize,
    /// Final thread state, for inspection
    pub context: ThreadContext,
}

impl Host {
    fn thread_context(&self, id: ThreadId, program: &Program) -> Result<ThreadContext, MemtraceError> {
        let mut memory = self.thread_memory_limit.map_or_else(AddressSpace::new, AddressSpace::with_limit);
        for shared in &self.shared {
            memory.map_image(shared.address, Arc::clone(&shared.image))?;
        }
        for &(base, len) in &program.regions {
            memory.map(base, len, Perms::RW)?;
        }
        let mut ctx = ThreadContext::new(id, memory);
        for &(reg, value) in &program.registers {
            ctx.machine.set_reg(reg, value);
        }
        Ok(ctx)
    }

    fn translate(client: &dyn InstrumentationClient, block: &BasicBlock) -> Result<Vec<Node>, MemtraceError> {
        let mut ilist = InstrList::from_app(block.instrs.clone());
        for at in ilist.app_handles() {
            client.instrument(&mut ilist, at)?;
        }
        debug!(
            "translated block 0x{:x}: {} app instrs -> {} nodes",
            block.tag,
            block.instrs.len(),
            ilist.len()
        );
        Ok(ilist.into_nodes())
    }

    fn execute(
        &self,
        client: &dyn InstrumentationClient,
        ctx: &mut ThreadContext,
        program: &Program,
    ) -> Result<(ExecStats, usize), MemtraceError> {
        let mut cache = CodeCache::new();
        for shared in &self.shared {
            cache.insert_shared(Arc::clone(&shared.fragment));
        }

        let mut stats = ExecStats::default();
        for _ in 0..program.iterations {
            for block in &program.blocks {
                let entry = if let Some(entry) = cache.entry_for(block.tag) {
                    entry
                } else {
                    let nodes = Self::translate(client, block)?;
                    cache.insert_block(block.tag, nodes)
                };
                let cpu = Cpu::new(&cache, &self.callbacks).with_step_limit(self.step_limit);
                stats.absorb(cpu.run(ctx, entry)?);
            }
        }
        Ok((stats, cache.block_count()))
    }

    /// Runs `program` as thread `id`: thread-start hook, execution,
    /// thread-end hook. The end hook runs even if execution fails.
    ///
    /// # Errors
    /// The first failure among setup, execution and the end hook.
    pub fn run_thread(
        &self,
        client: &dyn InstrumentationClient,
        id: ThreadId,
        program: &Program,
    ) -> Result<ThreadRun, MemtraceError> {
        let mut ctx = self.thread_context(id, program)?;
        client.on_thread_start(&mut ctx)?;
        info!("{id} started ({} blocks x {} iterations)", program.blocks.len(), program.iterations);

        let outcome = self.execute(client, &mut ctx, program);
        let teardown = client.on_thread_end(&mut ctx);
        let (stats, blocks_translated) = outcome?;
        teardown?;

        info!("{id} exited after {} app instructions", stats.app_instrs);
        Ok(ThreadRun { id, stats, blocks_translated, context: ctx })
    }
}
