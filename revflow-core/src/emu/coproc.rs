//! Coprocessor Stubs
//!
//! The ARM coprocessor interface: sixteen slots, each answering the seven
//! transfer/operation entry points. The base stub logs every call and
//! returns; real coprocessors (system control, VFP, ...) override the trait.

use crate::error::Result;
use crate::opcode::Operand;

/// Callable surface of one coprocessor slot.
///
/// Default methods log and return, which is what the analysis workloads
/// want from coprocessors they do not model.
pub trait CoProcessor {
    /// Slot number, used for log attribution.
    fn ident(&self) -> u8;

    fn stc(&mut self, opers: &[Operand]) -> Result<()> {
        log::info!("coproc {}: stc {:?}", self.ident(), opers);
        Ok(())
    }

    fn ldc(&mut self, opers: &[Operand]) -> Result<()> {
        log::info!("coproc {}: ldc {:?}", self.ident(), opers);
        Ok(())
    }

    fn cdp(&mut self, opers: &[Operand]) -> Result<()> {
        log::info!("coproc {}: cdp {:?}", self.ident(), opers);
        Ok(())
    }

    fn mcr(&mut self, opers: &[Operand]) -> Result<()> {
        log::info!("coproc {}: mcr {:?}", self.ident(), opers);
        Ok(())
    }

    fn mcrr(&mut self, opers: &[Operand]) -> Result<()> {
        log::info!("coproc {}: mcrr {:?}", self.ident(), opers);
        Ok(())
    }

    fn mrc(&mut self, opers: &[Operand]) -> Result<()> {
        log::info!("coproc {}: mrc {:?}", self.ident(), opers);
        Ok(())
    }

    fn mrrc(&mut self, opers: &[Operand]) -> Result<()> {
        log::info!("coproc {}: mrrc {:?}", self.ident(), opers);
        Ok(())
    }
}

/// Logging placeholder occupying every slot until a real coprocessor is
/// installed.
#[derive(Debug, Clone, Copy)]
pub struct CoProcStub {
    ident: u8,
}

impl CoProcStub {
    pub fn new(ident: u8) -> Self {
        Self { ident }
    }
}

impl CoProcessor for CoProcStub {
    fn ident(&self) -> u8 {
        self.ident
    }
}
