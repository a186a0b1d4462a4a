use bytes::Bytes;
use priam_cql::frame::response::result::{Prepared, ResultMetadata};
use priam_cql::frame::value::{CqlValue, ser_cql_value};
use std::collections::HashMap;

use crate::errors::BindError;
use crate::errors::RequestError;

/// Values to bind to a prepared statement's parameters: either one
/// value per parameter column in order, or a mapping keyed by column
/// name. A named mapping may omit columns; omitted parameters bind
/// null.
#[derive(Debug, Clone)]
pub enum QueryValues {
    Positional(Vec<Option<CqlValue>>),
    Named(HashMap<String, CqlValue>),
}

/// A statement prepared on the cluster: the server-assigned id, the
/// original CQL text, and the parameter column metadata the values are
/// encoded against.
///
/// Handles are shared; the coordinator caches them by CQL text and
/// hands out clones of one `Arc` while any caller keeps it alive.
pub struct PreparedQuery {
    id: Bytes,
    cql: String,
    param_metadata: ResultMetadata,
    result_metadata: Option<ResultMetadata>,
}

impl PreparedQuery {
    pub(crate) fn new(cql: String, prepared: Prepared) -> Self {
        PreparedQuery {
            id: prepared.id,
            cql,
            param_metadata: prepared.param_metadata,
            result_metadata: prepared.result_metadata,
        }
    }

    pub fn id(&self) -> &[u8] {
        &self.id
    }

    pub fn cql(&self) -> &str {
        &self.cql
    }

    pub fn param_metadata(&self) -> &ResultMetadata {
        &self.param_metadata
    }

    pub fn result_metadata(&self) -> Option<&ResultMetadata> {
        self.result_metadata.as_ref()
    }

    /// Encodes the given values against the parameter column types,
    /// producing the `[bytes]` payloads of an EXECUTE.
    pub(crate) fn bind(&self, values: &QueryValues) -> Result<Vec<Option<Vec<u8>>>, RequestError> {
        match values {
            QueryValues::Positional(values) => {
                if values.len() != self.param_metadata.col_specs.len() {
                    return Err(BindError::WrongValueCount {
                        expected: self.param_metadata.col_specs.len(),
                        got: values.len(),
                    }
                    .into());
                }
                values
                    .iter()
                    .zip(self.param_metadata.col_specs.iter())
                    .map(|(value, spec)| {
                        value
                            .as_ref()
                            .map(|value| ser_cql_value(value, &spec.typ))
                            .transpose()
                            .map_err(RequestError::from)
                    })
                    .collect()
            }
            QueryValues::Named(values) => {
                // Every provided name must match exactly one parameter
                // column; parameters with no matching name bind null.
                for name in values.keys() {
                    let matches = self
                        .param_metadata
                        .col_specs
                        .iter()
                        .filter(|spec| spec.name == *name)
                        .count();
                    match matches {
                        0 => return Err(BindError::UnknownName(name.clone()).into()),
                        1 => {}
                        _ => return Err(BindError::AmbiguousName(name.clone()).into()),
                    }
                }
                self.param_metadata
                    .col_specs
                    .iter()
                    .map(|spec| {
                        values
                            .get(&spec.name)
                            .map(|value| ser_cql_value(value, &spec.typ))
                            .transpose()
                            .map_err(RequestError::from)
                    })
                    .collect()
            }
        }
    }
}
