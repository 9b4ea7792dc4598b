//! Logging of faulty peer behaviour.
//!
//! Every protocol module defines its own `FaultKind` enumerating the ways a
//! peer can misbehave towards it. Handlers never fail because of a remote
//! peer: the offending message is dropped and a `Fault` blaming the sender is
//! appended to the step's `FaultLog`, which composite machines propagate
//! upwards, mapping the kind into their own.

pub use failure::Fail;

/// A report of faulty behaviour: which node is blamed (`node_id`) and what it
/// is blamed for (`kind`).
#[derive(Clone, Debug, PartialEq)]
pub struct Fault<N, F: Fail> {
    /// The faulty node's ID.
    pub node_id: N,
    /// The kind of fault the node is blamed for.
    pub kind: F,
}

impl<N, F: Fail> Fault<N, F> {
    /// Creates a new fault, blaming `node_id` for the `kind`.
    pub fn new(node_id: N, kind: F) -> Self {
        Fault { node_id, kind }
    }

    /// Applies `f_fault` to the kind, leaving the blamed node unchanged.
    pub fn map<F2: Fail, FF: Fn(F) -> F2>(self, f_fault: FF) -> Fault<N, F2> {
        Fault {
            node_id: self.node_id,
            kind: f_fault(self.kind),
        }
    }
}

impl<N, F: Fail> From<Fault<N, F>> for FaultLog<N, F> {
    fn from(fault: Fault<N, F>) -> Self {
        FaultLog(vec![fault])
    }
}

/// A collection of fault reports accumulated during one step.
#[derive(Debug, PartialEq)]
pub struct FaultLog<N, F: Fail>(pub Vec<Fault<N, F>>);

impl<N, F: Fail> FaultLog<N, F> {
    /// Creates an empty fault log.
    pub fn new() -> Self {
        FaultLog::default()
    }

    /// Creates a fault log containing a single entry.
    pub fn init(node_id: N, kind: F) -> Self {
        Fault::new(node_id, kind).into()
    }

    /// Records a new fault.
    pub fn append(&mut self, node_id: N, kind: F) {
        self.0.push(Fault::new(node_id, kind));
    }

    /// Appends all entries of `new_logs` to the end of `self`.
    pub fn extend(&mut self, new_logs: FaultLog<N, F>) {
        self.0.extend(new_logs.0);
    }

    /// Returns `true` if no fault was recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Applies `f_fault` to every entry's kind.
    pub fn map<F2: Fail, FF: Fn(F) -> F2>(self, f_fault: FF) -> FaultLog<N, F2> {
        FaultLog(self.into_iter().map(|f| f.map(&f_fault)).collect())
    }
}

impl<N, F: Fail> Default for FaultLog<N, F> {
    fn default() -> Self {
        FaultLog(Vec::new())
    }
}

impl<N, F: Fail> IntoIterator for FaultLog<N, F> {
    type Item = Fault<N, F>;
    type IntoIter = std::vec::IntoIter<Fault<N, F>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<N, F: Fail> std::iter::FromIterator<Fault<N, F>> for FaultLog<N, F> {
    fn from_iter<I: IntoIterator<Item = Fault<N, F>>>(iter: I) -> Self {
        FaultLog(iter.into_iter().collect())
    }
}
