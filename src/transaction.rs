use crate::effect::{flush_effects, is_running_effect, request_full_flush};
use std::cell::Cell;

// Thread-local transaction depth counter
// When > 0, signal emissions don't flush effects, not even sync ones
thread_local! {
    static TRANSACTION_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// RAII guard that ensures transaction cleanup happens even on panic.
struct TransactionGuard;

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        exit_transaction();
    }
}

fn enter_transaction() {
    TRANSACTION_DEPTH.with(|depth| depth.set(depth.get() + 1));
}

fn exit_transaction() {
    let outermost = TRANSACTION_DEPTH.with(|depth| {
        let next = depth.get().saturating_sub(1);
        depth.set(next);
        next == 0
    });

    if !outermost {
        return;
    }

    // Inside a running effect the flush that runs it takes over, batched effects included
    if is_running_effect() {
        request_full_flush();
    } else {
        flush_effects();
    }
}

/// Check if currently inside a transaction
///
/// When true, signal emissions only mark effects pending. They run when the
/// outermost transaction exits.
pub fn is_transaction_active() -> bool {
    TRANSACTION_DEPTH.with(Cell::get) > 0
}

/// Batch multiple signal changes into a single effect run
///
/// Inside a transaction even sync effects wait; on exit of the outermost
/// transaction every pending effect (sync and batched) runs once.
///
/// # Example
/// ```ignore
/// // Without transaction: a sync effect runs 3 times
/// voltage_signal.emit();
/// current_signal.emit();
/// load_signal.emit();
///
/// // With transaction: it runs once
/// Transaction::run(|| {
///     voltage_signal.emit();
///     current_signal.emit();
///     load_signal.emit();
/// });
/// ```
pub struct Transaction {
    _private: (),
}

impl Transaction {
    /// Run a function within a transaction context
    pub fn run<F, R>(f: F) -> R
    where
        F: FnOnce() -> R,
    {
        enter_transaction();

        // Exits the transaction on both normal return and unwinding
        let _guard = TransactionGuard;

        f()
    }
}
