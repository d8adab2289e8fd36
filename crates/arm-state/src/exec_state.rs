/// The guest CPU's run/halt state, distinct from the CPSR's IRQ-disable bit:
/// a halted CPU (e.g. via CP15 "wait for interrupt") still has its clock
/// ticking and resumes the instant a pending IRQ is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ExecState {
    Running,
    /// Halted; resumes on the next IRQ.
    Halted,
    /// Stopped; does not resume on IRQ (deeper sleep, left for the host to
    /// interpret its own way of waking the core).
    Stopped,
}

impl Default for ExecState {
    fn default() -> ExecState {
        ExecState::Running
    }
}
