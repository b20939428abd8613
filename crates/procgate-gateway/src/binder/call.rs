//! Call text and bind list generation

use super::args::{ArgValue, Argument, ArgumentTable};
use super::CallMode;
use crate::driver::{Bind, BindKind, BindValue};
use crate::transport::Environment;
use procgate_common::config::BindSettings;
use procgate_common::{GatewayError, Result};

/// Statement text plus its positional bind slots
#[derive(Debug, Clone, PartialEq)]
pub struct CallDescriptor {
    pub text: String,
    pub binds: Vec<Bind>,
}

impl CallDescriptor {
    pub fn statement(text: impl Into<String>, binds: Vec<Bind>) -> Self {
        Self {
            text: text.into(),
            binds,
        }
    }

    /// First bind produced from the named argument
    pub fn bind(&self, name: &str) -> Option<&Bind> {
        self.binds.iter().find(|b| b.name.eq_ignore_ascii_case(name))
    }

    /// Bind behind a placeholder such as `b2`
    pub fn placeholder(&self, placeholder: &str) -> Option<&Bind> {
        self.binds.iter().find(|b| b.placeholder == placeholder)
    }

    /// Bind slot of the OUT cursor, if the call has one
    pub fn cursor_bind(&self) -> Option<&Bind> {
        self.binds.iter().find(|b| b.kind == BindKind::Cursor)
    }
}

/// Accumulates binds, numbering placeholders and enforcing the slot cap
struct BindList {
    binds: Vec<Bind>,
    limit: usize,
}

impl BindList {
    fn new(limit: usize) -> Self {
        Self {
            binds: Vec::new(),
            limit,
        }
    }

    /// Append a bind and return its placeholder reference (`:bN`)
    fn push(&mut self, name: impl Into<String>, value: BindValue, kind: BindKind) -> Result<String> {
        if self.binds.len() >= self.limit {
            return Err(GatewayError::TooManyArguments {
                count: self.binds.len() + 1,
                limit: self.limit,
            });
        }
        let (declared_width, element_count) = match &value {
            BindValue::Text(v) => (v.len(), 1),
            BindValue::Texts(vs) => (vs.iter().map(String::len).max().unwrap_or(0), vs.len()),
            BindValue::Blob(b) => (b.len(), 1),
            BindValue::Null | BindValue::Locator(_) | BindValue::Output => (0, 1),
        };
        let placeholder = format!("b{}", self.binds.len() + 1);
        let reference = format!(":{}", placeholder);
        self.binds.push(Bind {
            placeholder,
            name: name.into(),
            value,
            declared_width,
            element_count,
            kind,
        });
        Ok(reference)
    }
}

/// Split `value` into pieces of at most `width` bytes on character boundaries
pub fn split_at_width(value: &str, width: usize) -> Vec<&str> {
    if width == 0 || value.len() <= width {
        return vec![value];
    }
    let mut pieces = Vec::new();
    let mut rest = value;
    while rest.len() > width {
        let mut cut = width;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        if cut == 0 {
            // Width narrower than a single character
            cut = rest.char_indices().nth(1).map(|(i, _)| i).unwrap_or(rest.len());
        }
        pieces.push(&rest[..cut]);
        rest = &rest[cut..];
    }
    if !rest.is_empty() {
        pieces.push(rest);
    }
    pieces
}

/// Build the call for `procedure` from the request arguments
pub fn build(
    procedure: &str,
    table: &ArgumentTable,
    mode: CallMode,
    settings: &BindSettings,
) -> Result<CallDescriptor> {
    build_with_cursor(procedure, table, mode, settings, None)
}

/// Like [`build`], with an OUT cursor argument appended
pub fn build_with_cursor(
    procedure: &str,
    table: &ArgumentTable,
    mode: CallMode,
    settings: &BindSettings,
    cursor: Option<&str>,
) -> Result<CallDescriptor> {
    let mut list = BindList::new(settings.max_binds);
    let mut parts = Vec::with_capacity(table.len() + 1);

    match mode {
        CallMode::Keyword => {
            for arg in table.iter() {
                let expr = render_argument(&mut list, arg, settings)?;
                parts.push(format!("{}=>{}", arg.name, expr));
            }
            if let Some(cursor) = cursor {
                let expr = list.push(cursor, BindValue::Output, BindKind::Cursor)?;
                parts.push(format!("{}=>{}", cursor, expr));
            }
        }
        CallMode::Positional => {
            for arg in table.iter() {
                parts.push(render_argument(&mut list, arg, settings)?);
            }
            if let Some(cursor) = cursor {
                parts.push(list.push(cursor, BindValue::Output, BindKind::Cursor)?);
            }
        }
        CallMode::Flexible { reduced } => {
            let (names, values) = flatten(table, settings)?;
            if !reduced {
                parts.push(list.push(
                    "num_entries",
                    BindValue::Text(names.len().to_string()),
                    BindKind::Scalar,
                )?);
            }
            parts.push(list.push("name_array", BindValue::Texts(names), BindKind::Collection)?);
            parts.push(list.push("value_array", BindValue::Texts(values), BindKind::Collection)?);
            if let Some(cursor) = cursor {
                parts.push(list.push(cursor, BindValue::Output, BindKind::Cursor)?);
            }
        }
    }

    Ok(CallDescriptor {
        text: format!("{}({})", procedure, parts.join(", ")),
        binds: list.binds,
    })
}

/// Bind one argument; returns the expression standing for it in the call text
fn render_argument(list: &mut BindList, arg: &Argument, settings: &BindSettings) -> Result<String> {
    match &arg.value {
        ArgValue::Scalar(value) => {
            let pieces = split_at_width(value, settings.max_scalar_width);
            if pieces.len() == 1 {
                return list.push(arg.name.as_str(), BindValue::Text(value.clone()), BindKind::Scalar);
            }
            let refs = pieces
                .iter()
                .enumerate()
                .map(|(i, piece)| {
                    list.push(
                        format!("{}.{}", arg.name, i + 1),
                        BindValue::Text((*piece).to_string()),
                        BindKind::Scalar,
                    )
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(refs.join("||"))
        }
        ArgValue::Collection(values) => list.push(
            arg.name.as_str(),
            BindValue::Texts(values.clone()),
            BindKind::Collection,
        ),
        ArgValue::Blob(data) => list.push(
            arg.name.as_str(),
            BindValue::Blob(data.clone()),
            BindKind::LargeObjectBlob,
        ),
    }
}

/// Parallel name/value arrays for the flexible calling form
fn flatten(table: &ArgumentTable, settings: &BindSettings) -> Result<(Vec<String>, Vec<String>)> {
    let mut names = Vec::new();
    let mut values = Vec::new();
    for arg in table.iter() {
        if let ArgValue::Blob(_) = arg.value {
            return Err(GatewayError::StreamingFormat(format!(
                "file field '{}' held in memory cannot be passed as a name/value pair",
                arg.name
            )));
        }
        for value in arg.value.texts() {
            let pieces = split_at_width(value, settings.max_scalar_width);
            if pieces.len() == 1 {
                names.push(arg.name.clone());
                values.push(value.to_string());
            } else {
                for (i, piece) in pieces.into_iter().enumerate() {
                    names.push(format!("{}.{}", arg.name, i + 1));
                    values.push(piece.to_string());
                }
            }
        }
    }
    if names.len() > settings.max_binds {
        return Err(GatewayError::TooManyArguments {
            count: names.len(),
            limit: settings.max_binds,
        });
    }
    Ok((names, values))
}

/// Call pushing the request environment as count, names and values
///
/// `text` carries the placeholders `:b1`, `:b2` and `:b3` in that order.
pub fn environment_call(text: &str, environment: &Environment) -> Result<CallDescriptor> {
    let (names, values): (Vec<String>, Vec<String>) = environment
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .unzip();
    let mut list = BindList::new(3);
    list.push("num_params", BindValue::Text(names.len().to_string()), BindKind::Scalar)?;
    list.push("param_names", BindValue::Texts(names), BindKind::Collection)?;
    list.push("param_values", BindValue::Texts(values), BindKind::Collection)?;
    Ok(CallDescriptor::statement(text, list.binds))
}
