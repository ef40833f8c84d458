//! Job composition — chains, parallel groups, joins, and the start/end
//! brackets that delimit a composite job's observable lifecycle.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Submittable description of one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    /// Name of the registered task to execute.
    pub task: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    /// Execution routing metadata (queue etc.).
    #[serde(default)]
    pub options: Map<String, Value>,
}

impl Signature {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            options: Map::new(),
        }
    }

    pub fn arg(mut self, value: Value) -> Self {
        self.args.push(value);
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }

    pub fn option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }
}

/// One item of a job body specification: a single unit, or a list of
/// units interpreted as a parallel group.
#[derive(Debug, Clone)]
pub enum BodyItem {
    Unit(Signature),
    Group(Vec<Signature>),
}

/// Execution graph of a composite job.
#[derive(Debug, Clone, PartialEq)]
pub enum Canvas {
    /// A single unit.
    Unit(Signature),
    /// Units (or sub-graphs) executed strictly in order.
    Chain(Vec<Canvas>),
    /// Independent units fanned out in parallel.
    Group(Vec<Signature>),
    /// A parallel fan-out whose completion triggers a join continuation.
    Chord {
        header: Vec<Signature>,
        callback: Box<Canvas>,
    },
}

impl Canvas {
    /// Count the signatures in the graph (brackets included).
    pub fn unit_count(&self) -> usize {
        match self {
            Canvas::Unit(_) => 1,
            Canvas::Chain(nodes) => nodes.iter().map(Canvas::unit_count).sum(),
            Canvas::Group(sigs) => sigs.len(),
            Canvas::Chord { header, callback } => header.len() + callback.unit_count(),
        }
    }
}

/// Build the execution graph for a job body, bracketed by `start` and
/// `end` units.
///
/// The body is walked in reverse: a plain unit becomes the continuation
/// of the item before it, and a group becomes a fan-out-then-join node
/// whose join is the previously bound continuation. The `start` unit is
/// linked to the head of the resulting chain, so its record exists before
/// any parallel branch begins; the `end` unit terminates every path and
/// its SUCCESS is the authoritative completion signal for the job.
pub fn build_job(start: Signature, body: Vec<BodyItem>, end: Signature) -> Canvas {
    let mut continuation = Canvas::Unit(end);
    for item in body.into_iter().rev() {
        continuation = match item {
            BodyItem::Unit(sig) => Canvas::Chain(vec![Canvas::Unit(sig), continuation]),
            BodyItem::Group(sigs) => Canvas::Chord {
                header: sigs,
                callback: Box::new(continuation),
            },
        };
    }
    Canvas::Chain(vec![Canvas::Unit(start), continuation])
}
