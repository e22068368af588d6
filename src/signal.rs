//! Demand-driven incremental signals.
//!
//! A [`Signal`] is a node in a graph of reactive values. Values are
//! "reconciled" (brought up to date with respect to parent signals) by
//! re-evaluating the graph top-down from the nodes a consumer demands.
//!
//! A newly created derived signal is unreconciled; it must be reconciled
//! before its value is valid. Each signal caches a value and a version.
//! When reconciliation changes the value, the version is incremented.
//! Derived signals track the versions of their parents to decide whether
//! they need to be recomputed, and a recomputed value that compares equal
//! to the cached one does not bump the version, damping propagation.
//!
//! Signals are reconciled with respect to a *level*, a monotonically
//! increasing counter issued by the host. When `reconcile` is called on a
//! signal already at the given level, nothing is done, so signals reached
//! by more than one path from the root are reconciled only once per pass.
//!
//! Some nodes may not be reached by a call to `reconcile` (e.g. in
//! `b.flat_map(..)` only the currently selected branch is reached). If an
//! unreached node is demanded by a later pass, it is reconciled then.
//! There can be multiple roots, or disjoint graphs; only the parts reached
//! by a call to `reconcile` are brought current.
//!
//! The graph is single-threaded and synchronous: all mutation happens
//! inside the call stack of `reconcile`, and external inputs arrive via
//! [`Cell::set`] between passes.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::error::SignalError;

/// Value of a signal: a cached `Result`, never a bare panic.
pub type Try<T> = Result<T, SignalError>;

/// Identifier of one reconciliation pass. Levels issued to the same graph
/// must strictly increase across passes and start above zero.
pub type Level = u64;

/// Bound on signal value types: structural equality drives version
/// damping, and cloning hands values across node boundaries.
pub trait Value: Clone + PartialEq + 'static {}

impl<T: Clone + PartialEq + 'static> Value for T {}

/// One node's behavior; every node kind shares this reconcile/value/version
/// contract and is shared behind `Rc` (the graph is not a tree).
pub(crate) trait SignalNode<T> {
    /// Bring this node current for `level`, recomputing the cached value
    /// as needed. A node already at `level` does nothing.
    fn reconcile(&self, level: Level);

    /// Clone of the cached value.
    fn value(&self) -> Try<T>;

    /// Version of the cached value, incremented exactly when it changes.
    fn version(&self) -> u64;
}

/// Handle to a node in the signal graph.
///
/// Cloning is cheap (reference-counted). Equality is identity: two handles
/// are equal iff they point at the same node, which is what lets mappings
/// of signals be diffed by the keyed adapter.
pub struct Signal<T>(Rc<dyn SignalNode<T>>);

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Signal(Rc::clone(&self.0))
    }
}

impl<T> PartialEq for Signal<T> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl<T> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signal(..)")
    }
}

impl<T: Value> Signal<T> {
    /// Wrap a node implementation; used by the keyed adapters.
    pub(crate) fn from_node(node: Rc<dyn SignalNode<T>>) -> Signal<T> {
        Signal(node)
    }

    /// A signal with a fixed value.
    pub fn constant(value: Try<T>) -> Signal<T> {
        Signal(Rc::new(ConstNode { value }))
    }

    /// A signal with a fixed `Ok` value.
    pub fn ok(value: T) -> Signal<T> {
        Signal::constant(Ok(value))
    }

    /// A signal with a fixed failure.
    pub fn err(err: SignalError) -> Signal<T> {
        Signal::constant(Err(err))
    }

    /// Reconcile this signal to `level`. After it returns, the value is
    /// current with respect to everything reached from this call.
    pub fn reconcile(&self, level: Level) {
        self.0.reconcile(level);
    }

    /// Clone of the cached value. Before the first reconciliation this is
    /// `Err(SignalError::Unreconciled)`.
    pub fn value(&self) -> Try<T> {
        self.0.value()
    }

    /// The cached `Ok` value.
    ///
    /// # Panics
    ///
    /// Panics if the cached value is a failure, including the case where
    /// the signal has never been reconciled; both are host programming
    /// errors at this call site. Use [`Signal::value`] or
    /// [`Signal::lift_to_try`] to observe failures.
    pub fn get(&self) -> T {
        match self.0.value() {
            Ok(value) => value,
            Err(err) => panic!("signal read failed: {err}"),
        }
    }

    /// Version of the cached value.
    pub fn version(&self) -> u64 {
        self.0.version()
    }

    /// Derived signal applying `f` to this signal's value.
    ///
    /// `f` runs only when this signal's version changed since the last
    /// reconciliation of the result; a parent failure short-circuits.
    pub fn map<U: Value>(&self, f: impl Fn(&T) -> U + 'static) -> Signal<U> {
        Signal(Rc::new(MapNode {
            parent: self.clone(),
            f: Box::new(f),
            state: RefCell::new(DerivedState::unreconciled()),
        }))
    }

    /// Derived signal whose inner structure depends on this signal's value.
    ///
    /// On a parent-version change, `f` rebuilds the inner signal
    /// (discarding the previous one) and reconciles it; otherwise the
    /// cached inner signal is merely re-reconciled. The untaken branch is
    /// never evaluated, which is how conditional dependency structure is
    /// realized, and how one subgraph's failure is kept from poisoning an
    /// unrelated one.
    pub fn flat_map<U: Value>(&self, f: impl Fn(&T) -> Signal<U> + 'static) -> Signal<U> {
        Signal(Rc::new(FlatMapNode {
            parent: self.clone(),
            f: Box::new(f),
            state: RefCell::new(FlatMapState {
                derived: DerivedState::unreconciled(),
                inner: None,
                inner_version: 0,
            }),
        }))
    }

    /// Converts a possibly-failing signal into an always-succeeding signal
    /// carrying the `Try` itself: the escape hatch that stops failure
    /// propagation at a chosen boundary.
    pub fn lift_to_try(&self) -> Signal<Try<T>> {
        Signal(Rc::new(LiftToTryNode {
            parent: self.clone(),
        }))
    }

    /// Transparent pass-through for tracing and error attribution.
    ///
    /// Reconciliation of the labeled signal runs inside a `tracing` span
    /// named after the label, and emits a trace event when the value
    /// changed. No effect on value or version.
    pub fn label(&self, name: &'static str) -> Signal<T> {
        Signal(Rc::new(LabelNode {
            name,
            parent: self.clone(),
        }))
    }

    /// Stateful map: `f` receives the current input, the previous input,
    /// and the previous output. The carrier for incremental folds such as
    /// the compiler driver's artifact cache.
    pub fn map_with_prev<U: Value>(
        &self,
        init_input: T,
        init_output: U,
        f: impl Fn(&T, &T, &U) -> U + 'static,
    ) -> Signal<U> {
        let prev = RefCell::new((init_input, init_output));
        self.map(move |input| {
            let output = {
                let prev = prev.borrow();
                f(input, &prev.0, &prev.1)
            };
            *prev.borrow_mut() = (input.clone(), output.clone());
            output
        })
    }
}

impl<T: Value> Signal<T> {
    /// Tuple of all parents' values, recomputed when any parent's version
    /// changed. If several parents fail in the same pass, the first in
    /// argument order is reported.
    pub fn join<U: Value>(a: &Signal<T>, b: &Signal<U>) -> Signal<(T, U)> {
        Signal(Rc::new(Join2Node {
            a: a.clone(),
            b: b.clone(),
            state: RefCell::new(DerivedState::unreconciled()),
            versions: RefCell::new((0, 0)),
        }))
    }

    /// Three-way [`Signal::join`].
    pub fn join3<U: Value, V: Value>(
        a: &Signal<T>,
        b: &Signal<U>,
        c: &Signal<V>,
    ) -> Signal<(T, U, V)> {
        Signal::join(&Signal::join(a, b), c).map(|((a, b), c)| (a.clone(), b.clone(), c.clone()))
    }

    /// Join of a homogeneous list of signals. An empty list yields a
    /// constant empty vector.
    pub fn join_all(signals: &[Signal<T>]) -> Signal<Vec<T>> {
        if signals.is_empty() {
            return Signal::ok(Vec::new());
        }
        let versions = vec![0; signals.len()];
        Signal(Rc::new(JoinAllNode {
            parents: signals.to_vec(),
            state: RefCell::new(DerivedState::unreconciled()),
            versions: RefCell::new(versions),
        }))
    }
}

/// Shared bookkeeping of a derived node: cached value, own version, last
/// reconciled level, and the last observed version of the primary parent.
struct DerivedState<T> {
    value: Try<T>,
    version: u64,
    level: Level,
    parent_version: u64,
}

impl<T> DerivedState<T> {
    fn unreconciled() -> Self {
        DerivedState {
            value: Err(SignalError::Unreconciled),
            version: 0,
            level: 0,
            parent_version: 0,
        }
    }

    /// Install a recomputed value, bumping the version only on change.
    fn commit(&mut self, value: Try<T>)
    where
        T: PartialEq,
    {
        if value != self.value {
            self.value = value;
            self.version += 1;
        }
    }
}

struct ConstNode<T> {
    value: Try<T>,
}

impl<T: Value> SignalNode<T> for ConstNode<T> {
    fn reconcile(&self, _level: Level) {}

    fn value(&self) -> Try<T> {
        self.value.clone()
    }

    // Nonzero so that fresh derived nodes (which have seen parent version
    // zero) compute once.
    fn version(&self) -> u64 {
        1
    }
}

struct MapNode<T, U> {
    parent: Signal<T>,
    f: Box<dyn Fn(&T) -> U>,
    state: RefCell<DerivedState<U>>,
}

impl<T: Value, U: Value> SignalNode<U> for MapNode<T, U> {
    fn reconcile(&self, level: Level) {
        {
            let mut state = self.state.borrow_mut();
            if state.level == level {
                return;
            }
            state.level = level;
        }
        self.parent.reconcile(level);
        let parent_version = self.parent.version();
        if self.state.borrow().parent_version == parent_version {
            return;
        }
        // Compute outside the borrow: `f` may reconcile other signals.
        let value = self.parent.value().map(|t| (self.f)(&t));
        let mut state = self.state.borrow_mut();
        state.parent_version = parent_version;
        state.commit(value);
    }

    fn value(&self) -> Try<U> {
        self.state.borrow().value.clone()
    }

    fn version(&self) -> u64 {
        self.state.borrow().version
    }
}

struct FlatMapState<U> {
    derived: DerivedState<U>,
    inner: Option<Signal<U>>,
    inner_version: u64,
}

struct FlatMapNode<T, U> {
    parent: Signal<T>,
    f: Box<dyn Fn(&T) -> Signal<U>>,
    state: RefCell<FlatMapState<U>>,
}

impl<T: Value, U: Value> SignalNode<U> for FlatMapNode<T, U> {
    fn reconcile(&self, level: Level) {
        {
            let mut state = self.state.borrow_mut();
            if state.derived.level == level {
                return;
            }
            state.derived.level = level;
        }
        self.parent.reconcile(level);
        let parent_version = self.parent.version();

        let value;
        if self.state.borrow().derived.parent_version == parent_version {
            // Parent unchanged: follow the cached inner signal, if any.
            let Some(inner) = self.state.borrow().inner.clone() else {
                return;
            };
            inner.reconcile(level);
            let inner_version = inner.version();
            let mut state = self.state.borrow_mut();
            if state.inner_version == inner_version {
                return;
            }
            state.inner_version = inner_version;
            value = inner.value();
        } else {
            match self.parent.value() {
                Ok(t) => {
                    // Rebuild the inner signal; the previous one is simply
                    // never reconciled again.
                    let inner = (self.f)(&t);
                    inner.reconcile(level);
                    value = inner.value();
                    let mut state = self.state.borrow_mut();
                    state.parent_versioned(parent_version);
                    state.inner_version = inner.version();
                    state.inner = Some(inner);
                }
                Err(err) => {
                    let mut state = self.state.borrow_mut();
                    state.parent_versioned(parent_version);
                    state.inner = None;
                    state.inner_version = 0;
                    value = Err(err);
                }
            }
        }
        self.state.borrow_mut().derived.commit(value);
    }

    fn value(&self) -> Try<U> {
        self.state.borrow().derived.value.clone()
    }

    fn version(&self) -> u64 {
        self.state.borrow().derived.version
    }
}

impl<U> FlatMapState<U> {
    fn parent_versioned(&mut self, parent_version: u64) {
        self.derived.parent_version = parent_version;
    }
}

struct LiftToTryNode<T> {
    parent: Signal<T>,
}

impl<T: Value> SignalNode<Try<T>> for LiftToTryNode<T> {
    fn reconcile(&self, level: Level) {
        self.parent.reconcile(level);
    }

    fn value(&self) -> Try<Try<T>> {
        Ok(self.parent.value())
    }

    fn version(&self) -> u64 {
        self.parent.version()
    }
}

struct LabelNode<T> {
    name: &'static str,
    parent: Signal<T>,
}

impl<T: Value> SignalNode<T> for LabelNode<T> {
    fn reconcile(&self, level: Level) {
        let before = self.parent.version();
        let span = tracing::trace_span!("reconcile", label = self.name, level);
        let _entered = span.enter();
        self.parent.reconcile(level);
        if self.parent.version() != before {
            tracing::trace!(label = self.name, version = self.parent.version(), "changed");
        }
    }

    fn value(&self) -> Try<T> {
        self.parent.value()
    }

    fn version(&self) -> u64 {
        self.parent.version()
    }
}

struct Join2Node<A, B> {
    a: Signal<A>,
    b: Signal<B>,
    state: RefCell<DerivedState<(A, B)>>,
    versions: RefCell<(u64, u64)>,
}

impl<A: Value, B: Value> SignalNode<(A, B)> for Join2Node<A, B> {
    fn reconcile(&self, level: Level) {
        {
            let mut state = self.state.borrow_mut();
            if state.level == level {
                return;
            }
            state.level = level;
        }
        self.a.reconcile(level);
        self.b.reconcile(level);
        let versions = (self.a.version(), self.b.version());
        if *self.versions.borrow() == versions {
            return;
        }
        *self.versions.borrow_mut() = versions;
        let value = match (self.a.value(), self.b.value()) {
            (Ok(a), Ok(b)) => Ok((a, b)),
            // First failing parent in argument order wins.
            (Err(err), _) => Err(err),
            (_, Err(err)) => Err(err),
        };
        self.state.borrow_mut().commit(value);
    }

    fn value(&self) -> Try<(A, B)> {
        self.state.borrow().value.clone()
    }

    fn version(&self) -> u64 {
        self.state.borrow().version
    }
}

struct JoinAllNode<T> {
    parents: Vec<Signal<T>>,
    state: RefCell<DerivedState<Vec<T>>>,
    versions: RefCell<Vec<u64>>,
}

impl<T: Value> SignalNode<Vec<T>> for JoinAllNode<T> {
    fn reconcile(&self, level: Level) {
        {
            let mut state = self.state.borrow_mut();
            if state.level == level {
                return;
            }
            state.level = level;
        }
        let versions: Vec<u64> = self
            .parents
            .iter()
            .map(|parent| {
                parent.reconcile(level);
                parent.version()
            })
            .collect();
        if *self.versions.borrow() == versions {
            return;
        }
        *self.versions.borrow_mut() = versions;
        let value = self
            .parents
            .iter()
            .map(|parent| parent.value())
            .collect::<Try<Vec<T>>>();
        self.state.borrow_mut().commit(value);
    }

    fn value(&self) -> Try<Vec<T>> {
        self.state.borrow().value.clone()
    }

    fn version(&self) -> u64 {
        self.state.borrow().version
    }
}

struct CellNode<T> {
    state: RefCell<(Try<T>, u64)>,
    on_change: Option<Box<dyn Fn()>>,
}

impl<T: Value> SignalNode<T> for CellNode<T> {
    fn reconcile(&self, _level: Level) {}

    fn value(&self) -> Try<T> {
        self.state.borrow().0.clone()
    }

    fn version(&self) -> u64 {
        self.state.borrow().1
    }
}

/// Mutable leaf signal, settable from outside the graph.
///
/// `set` bumps the version iff the new value is unequal to the old, then
/// invokes the optional change callback (the host's "schedule another
/// pass" hook). Multiple sets between passes coalesce naturally: only the
/// current state is kept.
pub struct Cell<T> {
    node: Rc<CellNode<T>>,
}

impl<T> Clone for Cell<T> {
    fn clone(&self) -> Self {
        Cell {
            node: Rc::clone(&self.node),
        }
    }
}

impl<T> fmt::Debug for Cell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cell(..)")
    }
}

impl<T: Value> Cell<T> {
    /// New cell holding `value`.
    pub fn new(value: Try<T>) -> Cell<T> {
        Cell {
            node: Rc::new(CellNode {
                state: RefCell::new((value, 1)),
                on_change: None,
            }),
        }
    }

    /// New cell holding `Ok(value)`.
    pub fn ok(value: T) -> Cell<T> {
        Cell::new(Ok(value))
    }

    /// New cell invoking `on_change` after each effective `set`.
    pub fn with_on_change(value: Try<T>, on_change: impl Fn() + 'static) -> Cell<T> {
        Cell {
            node: Rc::new(CellNode {
                state: RefCell::new((value, 1)),
                on_change: Some(Box::new(on_change)),
            }),
        }
    }

    /// Store `value`. A structurally equal value is a no-op: no version
    /// bump, no callback, no downstream propagation.
    pub fn set(&self, value: Try<T>) {
        {
            let mut state = self.node.state.borrow_mut();
            if state.0 == value {
                return;
            }
            state.0 = value;
            state.1 += 1;
        }
        if let Some(on_change) = &self.node.on_change {
            on_change();
        }
    }

    /// Store `Ok(value)`.
    pub fn set_ok(&self, value: T) {
        self.set(Ok(value));
    }

    /// Store a failure.
    pub fn set_err(&self, err: SignalError) {
        self.set(Err(err));
    }

    /// `set_ok(f(get()))`.
    ///
    /// # Panics
    ///
    /// Panics if the cell currently holds a failure.
    pub fn update(&self, f: impl FnOnce(&T) -> T) {
        let next = f(&self.get());
        self.set_ok(next);
    }

    /// Clone of the current value.
    pub fn value(&self) -> Try<T> {
        self.node.state.borrow().0.clone()
    }

    /// The current `Ok` value.
    ///
    /// # Panics
    ///
    /// Panics if the cell holds a failure.
    pub fn get(&self) -> T {
        match self.value() {
            Ok(value) => value,
            Err(err) => panic!("cell read failed: {err}"),
        }
    }

    /// Current version.
    pub fn version(&self) -> u64 {
        self.node.state.borrow().1
    }

    /// Handle to this cell as a signal.
    pub fn signal(&self) -> Signal<T> {
        Signal(self.node.clone())
    }
}

struct RefNode<T> {
    slot: RefCell<Option<Signal<T>>>,
}

impl<T: Value> RefNode<T> {
    fn attached(&self) -> Signal<T> {
        match &*self.slot.borrow() {
            Some(signal) => signal.clone(),
            None => panic!("forward reference used before attach"),
        }
    }
}

impl<T: Value> SignalNode<T> for RefNode<T> {
    fn reconcile(&self, level: Level) {
        self.attached().reconcile(level);
    }

    fn value(&self) -> Try<T> {
        self.attached().value()
    }

    fn version(&self) -> u64 {
        self.attached().version()
    }
}

/// Two-phase forward reference: an empty slot usable as a signal before
/// its eventual referent exists.
///
/// The slot must be attached exactly once. Reconciling or reading an
/// unattached reference, or attaching twice, panics — both are host
/// programming errors.
pub struct Ref<T> {
    node: Rc<RefNode<T>>,
}

impl<T> Clone for Ref<T> {
    fn clone(&self) -> Self {
        Ref {
            node: Rc::clone(&self.node),
        }
    }
}

impl<T> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ref(..)")
    }
}

impl<T: Value> Ref<T> {
    /// New unattached reference.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Ref<T> {
        Ref {
            node: Rc::new(RefNode {
                slot: RefCell::new(None),
            }),
        }
    }

    /// Attach the referent. Panics if already attached.
    pub fn attach(&self, signal: Signal<T>) {
        let mut slot = self.node.slot.borrow_mut();
        if slot.is_some() {
            panic!("forward reference already attached");
        }
        *slot = Some(signal);
    }

    /// Handle to this reference as a signal.
    pub fn signal(&self) -> Signal<T> {
        Signal(self.node.clone())
    }
}
