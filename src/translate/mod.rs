//! Request translation
//!
//! Turns the tag list of an inbound job request event into the
//! normalized [`JobRequest`](crate::domain::JobRequest) shape. The tag
//! vocabulary is fixed by the protocol:
//!
//! - `["i", value, kind]` declares an input
//! - `["param", name, value...]` declares a named parameter; `ratio`
//!   and `size` may carry several positional values
//! - `["output", mimeType]` declares the desired result representation
//!
//! Parsing is strict: a numeric parameter that does not parse, or a
//! dimension parameter missing its delimiter, is a translation error
//! and aborts the job before dispatch. Nothing is silently defaulted.

use std::collections::BTreeMap;
use thiserror::Error;

/// Errors raised while translating an event into a job request
#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("parameter {param} has non-numeric value {value:?}")]
    InvalidNumber { param: String, value: String },

    #[error("parameter {param} value {value:?} is missing the {delimiter:?} delimiter")]
    MalformedDimension {
        param: String,
        value: String,
        delimiter: char,
    },

    #[error("missing required input of kind {0:?}")]
    MissingInput(&'static str),
}

/// One `i` tag: the input value and its declared kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventInput {
    pub value: String,
    pub kind: String,
}

/// Everything a single walk of the tag list accumulates
///
/// Duplicate parameter names keep the last-seen tag.
#[derive(Debug, Clone, Default)]
pub struct RequestTags {
    pub inputs: Vec<EventInput>,
    pub output_mime: Option<String>,
    params: BTreeMap<String, Vec<String>>,
}

impl RequestTags {
    /// Walk the tag list once
    pub fn parse(tags: &[Vec<String>]) -> Self {
        let mut parsed = Self::default();
        for tag in tags {
            match tag.first().map(|s| s.as_str()) {
                Some("i") => {
                    if let (Some(value), Some(kind)) = (tag.get(1), tag.get(2)) {
                        parsed.inputs.push(EventInput {
                            value: value.clone(),
                            kind: kind.clone(),
                        });
                    }
                }
                Some("output") => {
                    if let Some(mime) = tag.get(1) {
                        parsed.output_mime = Some(mime.clone());
                    }
                }
                Some("param") => {
                    if let Some(name) = tag.get(1) {
                        // last-seen wins on duplicates
                        parsed.params.insert(name.clone(), tag[2..].to_vec());
                    }
                }
                _ => {}
            }
        }
        parsed
    }

    /// Positional values of a parameter
    pub fn param_values(&self, name: &str) -> Option<&[String]> {
        self.params.get(name).map(|v| v.as_slice())
    }

    /// First value of a parameter
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .get(name)
            .and_then(|v| v.first())
            .map(|s| s.as_str())
    }

    /// First value of a numeric parameter; a parse failure propagates
    pub fn number(&self, name: &str) -> Result<Option<f64>, TranslateError> {
        match self.param(name) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<f64>()
                .map(Some)
                .map_err(|_| TranslateError::InvalidNumber {
                    param: name.to_string(),
                    value: raw.to_string(),
                }),
        }
    }

    /// The last input of the given kind, if any
    pub fn input_of_kind(&self, kind: &str) -> Option<&str> {
        self.inputs
            .iter()
            .rev()
            .find(|input| input.kind == kind)
            .map(|input| input.value.as_str())
    }

    /// Whether every input declares the given kind
    pub fn all_inputs_are(&self, kind: &str) -> bool {
        self.inputs.iter().all(|input| input.kind == kind)
    }

    /// Parameter names not in `known`, with their first value
    pub fn unrecognized<'a>(
        &'a self,
        known: &'a [&'a str],
    ) -> impl Iterator<Item = (&'a str, &'a str)> {
        self.params
            .iter()
            .filter(move |(name, _)| !known.contains(&name.as_str()))
            .filter_map(|(name, values)| {
                values.first().map(|v| (name.as_str(), v.as_str()))
            })
    }
}

/// Image dimensions assembled from the `ratio` and `size` parameters
///
/// `size`, when present, supplies the explicit width/height and takes
/// precedence over anything `ratio` implies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dimensions {
    pub ratio_width: String,
    pub ratio_height: String,
    pub width: String,
    pub height: String,
}

impl Default for Dimensions {
    fn default() -> Self {
        Self {
            ratio_width: "1".to_string(),
            ratio_height: "1".to_string(),
            width: String::new(),
            height: String::new(),
        }
    }
}

impl Dimensions {
    pub fn from_tags(tags: &RequestTags) -> Result<Self, TranslateError> {
        let mut dims = Self::default();

        if let Some(values) = tags.param_values("ratio") {
            let (w, h) = split_pair("ratio", values, ':')?;
            dims.ratio_width = w;
            dims.ratio_height = h;
        }

        if let Some(values) = tags.param_values("size") {
            let (w, h) = split_pair("size", values, 'x')?;
            dims.width = w;
            dims.height = h;
        }

        Ok(dims)
    }

    /// The `ratio` option value, e.g. "4-3"
    pub fn ratio_label(&self) -> String {
        format!("{}-{}", self.ratio_width, self.ratio_height)
    }
}

/// One positional value is split on the delimiter; two or more are
/// taken positionally
fn split_pair(
    param: &str,
    values: &[String],
    delimiter: char,
) -> Result<(String, String), TranslateError> {
    match values {
        [single] => {
            let (w, h) = single
                .split_once(delimiter)
                .ok_or_else(|| TranslateError::MalformedDimension {
                    param: param.to_string(),
                    value: single.clone(),
                    delimiter,
                })?;
            Ok((w.to_string(), h.to_string()))
        }
        [w, h, ..] => Ok((w.clone(), h.clone())),
        [] => Err(TranslateError::MalformedDimension {
            param: param.to_string(),
            value: String::new(),
            delimiter,
        }),
    }
}
