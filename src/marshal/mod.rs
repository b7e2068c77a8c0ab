//! Parameter marshalling between live sessions and portable snapshots
//!
//! Three operations around one graph/session pair:
//!
//! - [`annotate_graph`] adds a placeholder and an assign op per variable,
//!   so values can be injected into a freshly imported graph later;
//! - [`extract_variables`] snapshots every variable value into a map of
//!   portable [`TensorTuple`]s;
//! - [`restore_variables`] applies such a snapshot through the annotation
//!   ops in a single batched run.
//!
//! Annotation can either be repeated on every load before restoring, or
//! done once with the annotated graph def persisted next to the snapshot.

mod codec;

pub use codec::{TensorTuple, MAX_TENSOR_BYTES};

use crate::graph::{Graph, OpDef, OpKind, Session};
use crate::{Error, Result};
use std::collections::BTreeMap;

/// A complete snapshot of variable values: exactly one entry per variable
/// op present in the graph at snapshot time, never partial.
pub type VariableSnapshot = BTreeMap<String, TensorTuple>;

/// Name of the injection placeholder for a variable.
pub fn restore_placeholder_name(variable: &str) -> String {
    format!("{variable}/restore-placeholder")
}

/// Name of the assign op wiring a variable to its injection placeholder.
pub fn assign_op_name(variable: &str) -> String {
    format!("{variable}/assign-from-placeholder")
}

/// Annotates a graph with one placeholder and one assign op per variable,
/// enabling [`restore_variables`] against any session later bound to it.
///
/// The variables are fetched in a single batched run so the recorded dtypes
/// reflect one consistent instant; the session must therefore already hold
/// initialized values. Annotating the same graph twice fails fast on the
/// duplicate op names.
pub fn annotate_graph(graph: &Graph, session: &Session) -> Result<()> {
    let variable_names = graph.variable_names();

    let mut runner = session.runner();
    for name in &variable_names {
        runner = runner.fetch(name.clone());
    }
    let fetched = runner.run()?;

    if fetched.len() != variable_names.len() {
        return Err(Error::FetchCountMismatch {
            requested: variable_names.len(),
            fetched: fetched.len(),
        });
    }

    for (name, tensor) in variable_names.iter().zip(fetched.iter()) {
        let placeholder = restore_placeholder_name(name);
        let shape: Vec<i64> = tensor.shape().iter().map(|d| *d as i64).collect();
        graph.add_op(OpDef::new(
            placeholder.clone(),
            OpKind::Placeholder {
                dtype: tensor.dtype(),
                shape,
            },
            vec![],
        ))?;
        graph.add_op(OpDef::new(
            assign_op_name(name),
            OpKind::Assign,
            vec![name.clone(), placeholder],
        ))?;
    }
    Ok(())
}

/// Snapshots every variable value into a map of portable tuples.
///
/// One batched fetch covers all variables; a count mismatch or an
/// unmarshalable tensor aborts the whole extraction with no partial result.
pub fn extract_variables(graph: &Graph, session: &Session) -> Result<VariableSnapshot> {
    let variable_names = graph.variable_names();

    let mut runner = session.runner();
    for name in &variable_names {
        runner = runner.fetch(name.clone());
    }
    let fetched = runner.run()?;

    if fetched.len() != variable_names.len() {
        return Err(Error::FetchCountMismatch {
            requested: variable_names.len(),
            fetched: fetched.len(),
        });
    }

    let mut snapshot = VariableSnapshot::new();
    for (name, tensor) in variable_names.into_iter().zip(fetched.iter()) {
        snapshot.insert(name, TensorTuple::of(tensor)?);
    }
    Ok(snapshot)
}

/// Applies a snapshot to a session whose graph carries the annotation ops.
///
/// Every tuple is rebuilt and fed at its deterministic placeholder name and
/// all assign targets execute in one batched run, so the snapshot lands
/// atomically or not at all. Against an un-annotated graph the run fails
/// with [`Error::OpNotFound`] for the missing placeholder or assign op.
pub fn restore_variables(session: &Session, snapshot: &VariableSnapshot) -> Result<()> {
    let mut runner = session.runner();
    for (name, tuple) in snapshot {
        log::debug!("restoring '{}' of kind {}", name, tuple.kind);
        let tensor = tuple.rebuild()?;
        runner = runner
            .feed(restore_placeholder_name(name), tensor)
            .add_target(assign_op_name(name));
    }
    runner.run()?;
    Ok(())
}
