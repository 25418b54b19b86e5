//! C6 — the promotion controller: decides when a function graduates from
//! the interpreter to a compiled tier.
//!
//! Promotion is compile-time in the common case: [`crate::compile::Emitter`]
//! either accepts a function for a tier or rejects it, and that verdict is
//! cached. Division and modulo by zero are the one condition a compiled
//! entry accepts statically but can still hit at runtime; when it does, the
//! engine records a **bailout** (`Engine::bailout` in `crate::exec`) instead
//! of silently treating the dispatch as a normal compiled execution: the
//! tier is disabled for that function and no further dispatch counts as
//! `compiled_exec_count` for it, even though the instruction itself still
//! traps the same way interpreted code would.

use crate::module::Module;

/// Call-count threshold for the first promotion attempt (interpreter to
/// Tier0). Not specified by the original engine's public headers; chosen
/// to keep unit tests fast while still exercising multiple interpreted
/// calls first (documented as an open-question decision).
pub const TIER0_CALL_THRESHOLD: u32 = 8;

/// Call-count threshold for promoting an already-compiled Tier0 function to
/// Tier1.
pub const TIER1_CALL_THRESHOLD: u32 = 64;

/// Interpreted-opcode threshold that can trigger a Tier0 promotion before
/// `TIER0_CALL_THRESHOLD` calls have happened, for functions that are
/// called rarely but loop heavily (e.g. a single long-running top-level
/// call). `NOP` is excluded from the count it is compared against, so a
/// benchmarking loop built entirely of `NOP`s cannot promote itself.
pub const JIT_OPCODE_THRESHOLD: u64 = 2_000;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Tier {
	Tier0,
	Tier1,
}

#[derive(Debug, Clone)]
pub struct PromotionState {
	pub tier: Option<Tier>,
	pub call_count: u32,
	pub opcode_count: u64,
	pub compile_count: u32,
	pub compile_tick_tier0: u64,
	pub compile_tick_tier1: u64,
	pub compiled_exec_count: u32,
	pub tier1_exec_count: u32,
	pub dispatch_count: u32,
	/// Set once an `Emitter` rejects this function for Tier0 with
	/// `NotSupported`; no further Tier0 attempts are made.
	pub compiled_disabled: bool,
	/// Same, for Tier1 attempts once the function already sits at Tier0.
	pub tier1_disabled: bool,
}

impl Default for PromotionState {
	fn default() -> Self {
		Self {
			tier: None,
			call_count: 0,
			opcode_count: 0,
			compile_count: 0,
			compile_tick_tier0: 0,
			compile_tick_tier1: 0,
			compiled_exec_count: 0,
			tier1_exec_count: 0,
			dispatch_count: 0,
			compiled_disabled: false,
			tier1_disabled: false,
		}
	}
}

/// What the controller wants done as a result of observing a call or a run
/// of interpreted opcodes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PromotionAction {
	None,
	AttemptCompile(Tier),
}

/// Per-function promotion bookkeeping for one loaded module, plus the
/// global monotonic compile tick (spec's "compile-tick ordering invariant":
/// a function's `compile_tick_tier0` is always strictly less than its own
/// `compile_tick_tier1`, since both are stamped from the same counter).
#[derive(Debug, Clone)]
pub struct PromotionController {
	states: Vec<PromotionState>,
	tick: u64,
	/// Set by `Engine::new` when the caller disables JIT entirely; every
	/// `record_*` call then reports `PromotionAction::None` and leaves all
	/// counters at zero, matching spec.md §4.4's "caller disables
	/// compilation" clause.
	enabled: bool,
}

impl PromotionController {
	pub fn new(module: &Module) -> Self {
		Self::with_jit_enabled(module, true)
	}

	pub fn with_jit_enabled(module: &Module, enabled: bool) -> Self {
		Self { states: vec![PromotionState::default(); module.functions.len()], tick: 0, enabled }
	}

	pub fn tier(&self, func_index: u32) -> Option<Tier> {
		self.states[func_index as usize].tier
	}

	pub fn state(&self, func_index: u32) -> &PromotionState {
		&self.states[func_index as usize]
	}

	pub fn states(&self) -> &[PromotionState] {
		&self.states
	}

	/// Records a call to `func_index` and returns whether the controller
	/// wants a compile attempted now.
	pub fn record_call(&mut self, func_index: u32) -> PromotionAction {
		if !self.enabled {
			return PromotionAction::None;
		}
		let state = &mut self.states[func_index as usize];
		state.call_count += 1;
		Self::decide(state)
	}

	/// Records `count` opcodes interpreted while `func_index` was running
	/// uncompiled. `count` must already exclude `NOP` dispatches.
	pub fn record_opcodes(&mut self, func_index: u32, count: u64) -> PromotionAction {
		if !self.enabled {
			return PromotionAction::None;
		}
		let state = &mut self.states[func_index as usize];
		state.opcode_count += count;
		Self::decide(state)
	}

	/// Records a dispatch into `func_index`'s body through a live compiled
	/// entry. The caller has already confirmed a handle exists for the
	/// current tier; `compiled_exec_count`/`tier1_exec_count` are credited
	/// separately, only once that dispatch actually runs to completion
	/// (`record_compiled_completion`), so a bailout mid-body still counts
	/// the dispatch without counting the execution (spec.md §4.4 rule 7).
	pub fn record_dispatch(&mut self, func_index: u32) {
		self.states[func_index as usize].dispatch_count += 1;
	}

	/// Credits a dispatch that ran `tier`'s compiled entry to completion
	/// without bailing out (spec.md §4.4 rule 5).
	pub fn record_compiled_completion(&mut self, func_index: u32, tier: Tier) {
		let state = &mut self.states[func_index as usize];
		match tier {
			Tier::Tier1 => {
				state.tier1_exec_count += 1;
				state.compiled_exec_count += 1;
			}
			Tier::Tier0 => state.compiled_exec_count += 1,
		}
	}

	/// Records a persistent bailout out of `tier`'s compiled entry: no
	/// further dispatch is credited as a compiled execution for that tier on
	/// this function (spec.md §4.4 rule 7, "fallback one-shot" — testable
	/// property #8). The caller is responsible for invalidating the handle
	/// itself (`crate::compile::CompiledTable::invalidate`).
	pub fn record_bailout(&mut self, func_index: u32, tier: Tier) {
		let state = &mut self.states[func_index as usize];
		match tier {
			Tier::Tier0 => state.compiled_disabled = true,
			Tier::Tier1 => state.tier1_disabled = true,
		}
	}

	fn decide(state: &PromotionState) -> PromotionAction {
		match state.tier {
			None if !state.compiled_disabled
				&& (state.call_count > TIER0_CALL_THRESHOLD || state.opcode_count >= JIT_OPCODE_THRESHOLD) =>
			{
				PromotionAction::AttemptCompile(Tier::Tier0)
			}
			Some(Tier::Tier0) if !state.tier1_disabled && state.call_count >= TIER1_CALL_THRESHOLD => {
				PromotionAction::AttemptCompile(Tier::Tier1)
			}
			_ => PromotionAction::None,
		}
	}

	/// Applies the outcome of a compile attempt: `Ok` moves the function to
	/// the new tier and stamps the tier-specific compile tick from the
	/// shared monotonic counter; `Err(true)` disables further attempts at
	/// that tier (the emitter said `NotSupported`); `Err(false)` leaves the
	/// function eligible to retry on the next qualifying call
	/// (`TransientError`).
	pub fn record_compile_result(&mut self, func_index: u32, tier: Tier, result: Result<(), bool>) {
		let state = &mut self.states[func_index as usize];
		match result {
			Ok(()) => {
				state.compile_count += 1;
				self.tick += 1;
				match tier {
					Tier::Tier0 => state.compile_tick_tier0 = self.tick,
					Tier::Tier1 => state.compile_tick_tier1 = self.tick,
				}
				state.tier = Some(tier);
			}
			Err(permanent) => match tier {
				Tier::Tier0 => state.compiled_disabled = permanent,
				Tier::Tier1 => state.tier1_disabled = permanent,
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::module::ModuleBuilder;
	use pretty_assertions::assert_eq;

	#[test]
	fn promotes_after_call_threshold() {
		let builder = ModuleBuilder::new();
		let module = builder.build();
		let mut controller = PromotionController::new(&module);
		let mut action = PromotionAction::None;
		for _ in 0..=TIER0_CALL_THRESHOLD {
			action = controller.record_call(0);
		}
		assert_eq!(action, PromotionAction::AttemptCompile(Tier::Tier0));
	}

	#[test]
	fn pinned_function_never_promotes() {
		let mut controller = PromotionController { states: vec![PromotionState::default()], tick: 0, enabled: true };
		controller.record_compile_result(0, Tier::Tier0, Err(true));
		for _ in 0..1000 {
			assert_eq!(controller.record_call(0), PromotionAction::None);
		}
	}

	#[test]
	fn opcode_threshold_promotes_low_call_count_hot_loop() {
		let mut controller = PromotionController { states: vec![PromotionState::default()], tick: 0, enabled: true };
		controller.record_call(0);
		let action = controller.record_opcodes(0, JIT_OPCODE_THRESHOLD);
		assert_eq!(action, PromotionAction::AttemptCompile(Tier::Tier0));
	}

	#[test]
	fn tier0_promotes_to_tier1_after_threshold() {
		let mut controller = PromotionController { states: vec![PromotionState::default()], tick: 0, enabled: true };
		controller.record_compile_result(0, Tier::Tier0, Ok(()));
		let mut action = PromotionAction::None;
		for _ in 0..TIER1_CALL_THRESHOLD {
			action = controller.record_call(0);
		}
		assert_eq!(action, PromotionAction::AttemptCompile(Tier::Tier1));
	}

	#[test]
	fn compile_ticks_are_strictly_ordered_across_tiers() {
		let mut controller = PromotionController { states: vec![PromotionState::default()], tick: 0, enabled: true };
		controller.record_compile_result(0, Tier::Tier0, Ok(()));
		controller.record_compile_result(0, Tier::Tier1, Ok(()));
		let state = controller.state(0);
		assert!(state.compile_tick_tier0 < state.compile_tick_tier1);
	}

	#[test]
	fn disabled_controller_never_promotes() {
		let builder = ModuleBuilder::new();
		let module = builder.build();
		let mut controller = PromotionController::with_jit_enabled(&module, false);
		for _ in 0..10_000 {
			assert_eq!(controller.record_call(0), PromotionAction::None);
		}
		assert!(controller.tier(0).is_none());
	}
}
