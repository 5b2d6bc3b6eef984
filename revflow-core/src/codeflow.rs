//! Code-Flow Analyzer
//!
//! Worklist-driven disassembly that follows branches, calls and branch tables
//! from seed addresses to discover code blocks and functions. The analyzer
//! owns no opinion about decoding: it drives a [`FlowMemory`] for opcodes and
//! memory probes and reports everything it finds through a [`CodeFlowSink`].
//!
//! # Algorithm
//! `add_code_flow` pops `(pred, va)` pairs off an explicit worklist. Each
//! address is decoded at most once per campaign (`opdone`); the sink filters
//! the branch set; every branch is classified as table, deref, procedural or
//! plain flow. Procedural targets become functions on the spot ("deepest
//! first", so a callee's metadata exists before its caller's `function`
//! event), except when the target is already on the active recursion stack,
//! in which case it is deferred until the scan drains.
//!
//! Decode failures are logged and localized: the scan continues past them.
//! Memory probe failures silently prune a branch.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{Result, RevflowError};
use crate::memory::{MemoryImage, Perm};
use crate::opcode::{decoder, Arch, Branch, BranchFlags, Opcode};

/// Memory surface the analyzer scans. The workspace object providing this is
/// responsible for the actual `parse_opcode` implementation.
pub trait FlowMemory {
    /// Decode the instruction at `va`.
    fn parse_opcode(&self, va: u64, arch: Arch) -> Result<Opcode>;

    /// True when `[va, va + size)` is mapped with `perm`.
    fn probe(&self, va: u64, size: usize, perm: Perm) -> bool;

    /// Pointer-sized read at `va`.
    fn read_pointer(&self, va: u64) -> Option<u64>;

    /// True when `va` points into mapped memory.
    fn is_valid_pointer(&self, va: u64) -> bool;

    /// Pointer size in bytes.
    fn pointer_size(&self) -> usize;

    /// True when the surrounding workspace already knows `va` as a function.
    fn is_function(&self, _va: u64) -> bool {
        false
    }
}

impl<T: FlowMemory + ?Sized> FlowMemory for &T {
    fn parse_opcode(&self, va: u64, arch: Arch) -> Result<Opcode> {
        (**self).parse_opcode(va, arch)
    }

    fn probe(&self, va: u64, size: usize, perm: Perm) -> bool {
        (**self).probe(va, size, perm)
    }

    fn read_pointer(&self, va: u64) -> Option<u64> {
        (**self).read_pointer(va)
    }

    fn is_valid_pointer(&self, va: u64) -> bool {
        (**self).is_valid_pointer(va)
    }

    fn pointer_size(&self) -> usize {
        (**self).pointer_size()
    }

    fn is_function(&self, va: u64) -> bool {
        (**self).is_function(va)
    }
}

impl FlowMemory for MemoryImage {
    fn parse_opcode(&self, va: u64, _arch: Arch) -> Result<Opcode> {
        let word = self
            .read_u32(va)
            .ok_or(RevflowError::UnmappedMemory { va, size: 4 })?;
        decoder::parse_opcode(va, word)
    }

    fn probe(&self, va: u64, size: usize, perm: Perm) -> bool {
        MemoryImage::probe(self, va, size, perm)
    }

    fn read_pointer(&self, va: u64) -> Option<u64> {
        MemoryImage::read_pointer(self, va)
    }

    fn is_valid_pointer(&self, va: u64) -> bool {
        MemoryImage::is_valid_pointer(self, va)
    }

    fn pointer_size(&self) -> usize {
        MemoryImage::pointer_size(self)
    }
}

/// Metadata handed to the `function` event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionMeta {
    pub va: u64,
    /// Procedural branch targets discovered while scanning the function.
    pub calls_from: Vec<u64>,
}

/// Event sink for code-flow discovery. Default methods are identities, so
/// implementors override only the events they care about.
pub trait CodeFlowSink {
    /// Called for every newly parsed opcode; the returned branch set is the
    /// one the analyzer follows.
    fn opcode(&mut self, _va: u64, _op: &Opcode, branches: Vec<Branch>) -> Vec<Branch> {
        branches
    }

    /// Called exactly once per newly discovered function.
    fn function(&mut self, _fva: u64, _meta: &FunctionMeta) {}

    /// Called when a branch is suppressed by a no-flow entry.
    fn no_flow(&mut self, _va: u64, _destva: u64) {}

    /// Called for every resolved branch-table pointer; return `false` to
    /// stop walking the table.
    fn branch_table(&mut self, _tableva: u64, _ptrva: u64, _destva: u64) -> bool {
        true
    }

    /// Called for branches whose target could not be resolved. Resolvers may
    /// already have appended discovered targets to `branches`.
    fn dynamic_branch(
        &mut self,
        _va: u64,
        _op: &Opcode,
        _bflags: BranchFlags,
        _branches: &mut Vec<Branch>,
    ) {
    }
}

/// Sink that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl CodeFlowSink for NullSink {}

/// Resolver invoked for dynamic branches, in registration order. May append
/// resolved targets to the branch list.
pub type DynamicBranchResolver = Box<dyn FnMut(u64, &Opcode, BranchFlags, &mut Vec<Branch>)>;

/// Code-flow disassembly driver.
///
/// One context runs one discovery campaign at a time; `funcs` and `fcalls`
/// persist across campaigns for the lifetime of the context.
pub struct CodeFlowContext<M: FlowMemory, S: CodeFlowSink> {
    mem: M,
    sink: S,
    /// `Some` enables the persistent opdone set ("never disassemble the same
    /// thing twice").
    persist: Option<HashSet<u64>>,
    /// Expand branch tables during this phase.
    exptable: bool,
    /// Automatically flow into called functions.
    recurse: bool,
    funcs: HashSet<u64>,
    fcalls: HashMap<u64, Vec<u64>>,
    cf_noret: HashSet<u64>,
    cf_noflow: HashSet<(u64, u64)>,
    /// Active recursion stack for self/mutual-call detection.
    cf_blocks: Vec<u64>,
    resolvers: Vec<(&'static str, DynamicBranchResolver)>,
}

impl<M: FlowMemory, S: CodeFlowSink> CodeFlowContext<M, S> {
    pub fn new(mem: M, sink: S) -> Self {
        Self {
            mem,
            sink,
            persist: None,
            exptable: true,
            recurse: true,
            funcs: HashSet::new(),
            fcalls: HashMap::new(),
            cf_noret: HashSet::new(),
            cf_noflow: HashSet::new(),
            cf_blocks: Vec::new(),
            resolvers: Vec::new(),
        }
    }

    /// Remember every decoded address across campaigns, making repeat scans
    /// of the same seed idempotent.
    pub fn set_persist(&mut self, persist: bool) {
        match (persist, self.persist.is_some()) {
            (true, false) => self.persist = Some(HashSet::new()),
            (false, true) => self.persist = None,
            _ => {}
        }
    }

    pub fn set_expand_tables(&mut self, exptable: bool) {
        self.exptable = exptable;
    }

    pub fn set_recurse(&mut self, recurse: bool) {
        self.recurse = recurse;
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn mem(&self) -> &M {
        &self.mem
    }

    /// The persistent opdone set, when `persist` is enabled.
    pub fn opdone(&self) -> Option<&HashSet<u64>> {
        self.persist.as_ref()
    }

    /// Mark `va` as a non-returning procedural target: callers of it get
    /// their fall-through edge suppressed.
    pub fn add_no_return_addr(&mut self, va: u64) {
        self.cf_noret.insert(va);
    }

    /// Prevent flow from `va` to `destva`. `destva` may still be decoded by
    /// being reached some other way.
    pub fn add_no_flow(&mut self, va: u64, destva: u64) {
        self.cf_noflow.insert((va, destva));
    }

    /// True when `va` is a known function entry.
    pub fn is_function(&self, va: u64) -> bool {
        self.funcs.contains(&va)
    }

    /// Callees recorded for a discovered function.
    pub fn calls_from(&self, fva: u64) -> Option<&[u64]> {
        self.fcalls.get(&fva).map(|v| v.as_slice())
    }

    /// Seed a-priori knowledge of a function and its callees.
    pub fn add_function_def(&mut self, fva: u64, calls_from: Vec<u64>) {
        self.funcs.insert(fva);
        self.fcalls.insert(fva, calls_from);
    }

    /// Register a resolver for dynamic branches. Resolvers run in
    /// registration order.
    ///
    /// # Errors
    /// `DuplicateHandler` when `name` is already registered.
    pub fn add_dynamic_branch_handler(
        &mut self,
        name: &'static str,
        cb: DynamicBranchResolver,
    ) -> Result<()> {
        if self.resolvers.iter().any(|(n, _)| *n == name) {
            return Err(RevflowError::DuplicateHandler(name));
        }
        self.resolvers.push((name, cb));
        Ok(())
    }

    fn opdone_contains(&self, local: &HashSet<u64>, va: u64) -> bool {
        match self.persist.as_ref() {
            Some(set) => set.contains(&va),
            None => local.contains(&va),
        }
    }

    fn opdone_insert(&mut self, local: &mut HashSet<u64>, va: u64) {
        match self.persist.as_mut() {
            Some(set) => {
                set.insert(va);
            }
            None => {
                local.insert(va);
            }
        }
    }

    fn dynamic_branch(
        &mut self,
        va: u64,
        op: &Opcode,
        bflags: BranchFlags,
        branches: &mut Vec<Branch>,
    ) {
        for (_, cb) in self.resolvers.iter_mut() {
            cb(va, op, bflags, branches);
        }
        self.sink.dynamic_branch(va, op, bflags, branches);
    }

    /// Analyze a procedure entry point and flow downward to find all
    /// subsequent code blocks and procedure edges. Fires the `function`
    /// event exactly once per entry.
    pub fn add_entry_point(&mut self, va: u64, arch: Arch) {
        if self.funcs.contains(&va) {
            return;
        }
        self.funcs.insert(va);

        let calls_from = self.add_code_flow(va, arch);
        self.fcalls.insert(va, calls_from.clone());

        let meta = FunctionMeta { va, calls_from };
        self.sink.function(va, &meta);
    }

    /// Code-flow disassembly from `va`. Returns the procedural branch
    /// targets discovered during the scan, in discovery order.
    pub fn add_code_flow(&mut self, va: u64, arch: Arch) -> Vec<u64> {
        let mut local_opdone: HashSet<u64> = HashSet::new();
        let mut calls_from: Vec<u64> = Vec::new();
        let mut cf_eps: Vec<u64> = Vec::new();
        let mut optodo: Vec<((u64, u64), Arch)> = vec![((0, va), arch)];

        self.cf_blocks.push(va);

        while let Some((todo, arch)) = optodo.pop() {
            if self.cf_noflow.contains(&todo) {
                self.sink.no_flow(todo.0, todo.1);
                continue;
            }

            let (_pva, va) = todo;
            if self.opdone_contains(&local_opdone, va) {
                continue;
            }
            self.opdone_insert(&mut local_opdone, va);

            let op = match self.mem.parse_opcode(va, arch) {
                Ok(op) => op,
                Err(err) => {
                    log::warn!("parse error at 0x{:08x}: {}", va, err);
                    continue;
                }
            };

            let mut branches: Vec<Branch> = op.branches().into_vec();
            // the opcode callback may filter branches
            branches = self.sink.opcode(va, &op, branches);

            while let Some((bva, bflags)) = branches.pop() {
                // dynamic branch: no known target, let the resolvers take a
                // crack at it (they may append to `branches`)
                let Some(bva) = bva else {
                    self.dynamic_branch(va, &op, bflags, &mut branches);
                    continue;
                };

                // track the block on the active call stack for the duration
                // of its processing
                self.cf_blocks.push(bva);
                let flow = self.process_branch(
                    &op,
                    bva,
                    bflags,
                    &mut branches,
                    &mut calls_from,
                    &mut cf_eps,
                    arch,
                );
                self.cf_blocks.pop();

                if let Some(bva) = flow {
                    if !self.opdone_contains(&local_opdone, bva) {
                        optodo.push(((va, bva), arch));
                    }
                }
            }
        }

        self.cf_blocks.pop();

        // functions deferred because they were on the active stack
        while let Some(fva) = cf_eps.pop() {
            if !self.funcs.contains(&fva) && !self.mem.is_function(fva) {
                self.add_entry_point(fva, arch);
            }
        }

        calls_from
    }

    /// Classify one branch. Returns the address to enqueue for further flow,
    /// or `None` when the branch was consumed (table, call, pruned).
    #[allow(clippy::too_many_arguments)]
    fn process_branch(
        &mut self,
        op: &Opcode,
        bva: u64,
        bflags: BranchFlags,
        branches: &mut Vec<Branch>,
        calls_from: &mut Vec<u64>,
        cf_eps: &mut Vec<u64>,
        arch: Arch,
    ) -> Option<u64> {
        let va = op.va;
        let psize = self.mem.pointer_size();

        // a table branch adds one COND branch per unique pointer
        if bflags.contains(BranchFlags::TABLE) {
            if self.exptable {
                let mut ptrbase = bva;
                let mut tabdone: HashSet<u64> = HashSet::new();
                while let Some(bdest) = self.mem.read_pointer(ptrbase) {
                    if !self.mem.is_valid_pointer(bdest) {
                        break;
                    }
                    if !self.sink.branch_table(bva, ptrbase, bdest) {
                        break;
                    }
                    if tabdone.insert(bdest) {
                        branches.push((Some(bdest), BranchFlags::COND));
                    }
                    ptrbase += psize as u64;
                }
            }
            return None;
        }

        let mut bva = bva;
        if bflags.contains(BranchFlags::DEREF) {
            if !self.mem.probe(bva, psize, Perm::READ) {
                return None;
            }
            // check noret before bva becomes the pointed-to address
            if self.cf_noret.contains(&bva) {
                self.add_no_flow(va, op.next_va());
            }
            bva = self.mem.read_pointer(bva)?;
        }

        if !self.mem.probe(bva, 1, Perm::EXEC) {
            return None;
        }

        if bflags.contains(BranchFlags::PROC) {
            let nextva = op.next_va();

            // ignore call-next constructs used for pc-relative addressing
            if bva != nextva {
                if self.recurse {
                    // the branch target itself sits on top of the stack;
                    // recursion means it appears further down
                    let active = &self.cf_blocks[..self.cf_blocks.len().saturating_sub(1)];
                    if active.contains(&bva) {
                        // the target called us; defer until this scan is done
                        if !cf_eps.contains(&bva) {
                            cf_eps.push(bva);
                        }
                    } else {
                        // descend now so the deepest callbacks fire first
                        self.add_entry_point(bva, arch);
                    }
                }

                if self.cf_noret.contains(&bva) {
                    self.cf_noflow.insert((va, nextva));
                }

                if !calls_from.contains(&bva) {
                    calls_from.push(bva);
                }
            }

            // flow goes up to procedural branches, not across them
            return None;
        }

        Some(bva)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Endian;
    use crate::opcode::{COND_AL, IfFlags, Mnem, Operand};

    /// Records the order of `function` events.
    #[derive(Default)]
    struct RecordingSink {
        functions: Vec<(u64, Vec<u64>)>,
        noflows: Vec<(u64, u64)>,
    }

    impl CodeFlowSink for RecordingSink {
        fn function(&mut self, fva: u64, meta: &FunctionMeta) {
            self.functions.push((fva, meta.calls_from.clone()));
        }

        fn no_flow(&mut self, va: u64, destva: u64) {
            self.noflows.push((va, destva));
        }
    }

    fn text_image(words: &[(u64, u32)]) -> MemoryImage {
        let base = 0x1000;
        let mut bytes = vec![0u8; 0x1000];
        for (va, word) in words {
            let off = (*va - base) as usize;
            bytes[off..off + 4].copy_from_slice(&word.to_le_bytes());
        }
        let mut img = MemoryImage::new(4, Endian::Little);
        img.add_map(base, 0x1000, Perm::READ | Perm::EXEC, "text", bytes)
            .unwrap();
        img
    }

    #[test]
    fn decode_failure_is_localized() {
        // a branch into the undecodable unconditional space must not kill
        // the scan of the seed function
        let img = text_image(&[
            (0x1000, 0x1A00_0000), // bne 0x1008
            (0x1004, 0xF000_0000), // undecodable
            (0x1008, 0xE12F_FF1E), // bx lr
        ]);
        let mut cf = CodeFlowContext::new(img, NullSink);
        cf.add_entry_point(0x1000, Arch::Arm);
        assert!(cf.is_function(0x1000));
    }

    #[test]
    fn noflow_suppresses_edge_and_fires_event() {
        let img = text_image(&[
            (0x1000, 0xE1A0_0000), // mov r0, r0
            (0x1004, 0xE12F_FF1E), // bx lr
        ]);
        let mut cf = CodeFlowContext::new(img, RecordingSink::default());
        cf.add_no_flow(0x1000, 0x1004);
        cf.add_code_flow(0x1000, Arch::Arm);
        assert_eq!(cf.sink().noflows, vec![(0x1000, 0x1004)]);
    }

    #[test]
    fn duplicate_dynamic_handler_rejected() {
        let img = text_image(&[]);
        let mut cf = CodeFlowContext::new(img, NullSink);
        cf.add_dynamic_branch_handler("switchcase", Box::new(|_, _, _, _| {}))
            .unwrap();
        let err = cf
            .add_dynamic_branch_handler("switchcase", Box::new(|_, _, _, _| {}))
            .unwrap_err();
        assert_eq!(err, RevflowError::DuplicateHandler("switchcase"));
    }

    #[test]
    fn dynamic_resolver_can_feed_targets_back() {
        let img = text_image(&[
            (0x1000, 0xE12F_FF1E), // bx lr (dynamic)
            (0x1010, 0xE1A0_0000), // mov r0, r0
            (0x1014, 0xE12F_FF1E), // bx lr
        ]);
        let mut cf = CodeFlowContext::new(img, NullSink);
        cf.add_dynamic_branch_handler(
            "fixed-target",
            Box::new(|_va, _op, _flags, branches| {
                branches.push((Some(0x1010), BranchFlags::COND));
            }),
        )
        .unwrap();
        cf.set_persist(true);
        cf.add_code_flow(0x1000, Arch::Arm);
        let opdone = cf.opdone().unwrap();
        assert!(opdone.contains(&0x1010));
        assert!(opdone.contains(&0x1014));
    }

    #[test]
    fn sink_can_prune_branches() {
        struct Pruner;
        impl CodeFlowSink for Pruner {
            fn opcode(&mut self, _va: u64, _op: &Opcode, _branches: Vec<Branch>) -> Vec<Branch> {
                Vec::new()
            }
        }
        let img = text_image(&[(0x1000, 0xE1A0_0000), (0x1004, 0xE1A0_0000)]);
        let mut cf = CodeFlowContext::new(img, Pruner);
        cf.set_persist(true);
        cf.add_code_flow(0x1000, Arch::Arm);
        // only the seed was decoded
        assert_eq!(cf.opdone().unwrap().len(), 1);
    }

    #[test]
    fn call_next_constructs_are_ignored() {
        // bl to the very next instruction must not create a function
        let img = text_image(&[
            (0x1000, 0xEBFF_FFFF), // bl 0x1004
            (0x1004, 0xE12F_FF1E), // bx lr
        ]);
        let op = img.parse_opcode(0x1000, Arch::Arm).unwrap();
        assert_eq!(op.mnem, Mnem::Bl);
        assert_eq!(op.opers[0], Operand::Imm(0x1004));

        let mut cf = CodeFlowContext::new(img, RecordingSink::default());
        let calls = cf.add_code_flow(0x1000, Arch::Arm);
        assert!(calls.is_empty());
        assert!(cf.sink().functions.is_empty());
    }

    #[test]
    fn hand_built_opcode_shapes_flow() {
        // non-branch ops produce a single fall edge
        let op = Opcode::new(
            0x1000,
            4,
            Mnem::Mov,
            COND_AL,
            IfFlags::empty(),
            &[Operand::Reg(0), Operand::Reg(1)],
        );
        assert_eq!(op.branches()[0], (Some(0x1004), BranchFlags::FALL));
    }
}
