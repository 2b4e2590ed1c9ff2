use std::fmt::{self, Display};

/// A structured task identifier: a task name plus ordered `key=value`
/// arguments.
///
/// The canonical rendering is `Name(k1=v1,k2=v2)`. It is stable for a given
/// identifier and is what [`sanitize`] works from, but it carries no
/// round-trip guarantee; equality and hashing use the structured form.
///
/// # Example
///
/// ```
/// use permafrost::TaskId;
///
/// let id = TaskId::new("Compile").with("file", "a.c");
/// assert_eq!(id.to_string(), "Compile(file=a.c)");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskId {
    name: Box<str>,
    args: Vec<(Box<str>, Box<str>)>,
}

impl TaskId {
    pub fn new(name: impl Into<Box<str>>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Appends a keyed argument. Argument order is part of the identity.
    pub fn with(mut self, key: impl Into<Box<str>>, value: impl Into<Box<str>>) -> Self {
        self.args.push((key.into(), value.into()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[(Box<str>, Box<str>)] {
        &self.args
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, (key, value)) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{key}={value}")?;
        }
        write!(f, ")")
    }
}

/// Characters that separate the components of a rendered identifier.
const STRUCTURAL: &[char] = &['(', ')', ',', '#', '='];

/// Maps a task identifier to a filesystem-safe name.
///
/// The rendering is lowercased, every run of structural punctuation becomes a
/// single `_`, every remaining character outside `[a-z0-9_]` is stripped, and
/// edge underscores are trimmed. Strictly one-way: distinct identifiers can
/// collide, in which case the exclusive-create write surfaces the conflict.
pub fn sanitize(id: &TaskId) -> String {
    let rendered = id.to_string().to_lowercase();

    // Collapse structural runs first, then strip; stripping first would let
    // runs separated only by stripped characters merge.
    let mut collapsed = String::with_capacity(rendered.len());
    let mut in_run = false;
    for ch in rendered.chars() {
        if STRUCTURAL.contains(&ch) {
            if !in_run {
                collapsed.push('_');
            }
            in_run = true;
        } else {
            collapsed.push(ch);
            in_run = false;
        }
    }

    let cleaned: String = collapsed
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_')
        .collect();

    cleaned.trim_matches('_').to_string()
}
