use std::env;
use std::io::IsTerminal;

/// Failure classes surfaced by the detector. Every failed rewrite produces at
/// least one diagnostic; none of them are reported by panicking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagKind {
    SanityFailed,
    BadPredicate,
    NonAffine,
    NotDivisible,
    CannotDivideByIterator,
    FuseFailed,
    CannotDivSumWithBase,
    InconsistentOffset,
    UnnormalizablePredicate,
    OverlappingConstraints,
    IncompleteSplit,
    UncoveredMark,
    NotIndependent,
}

impl DiagKind {
    pub fn code(self) -> &'static str {
        match self {
            Self::SanityFailed => "IA0001",
            Self::BadPredicate => "IA0002",
            Self::NonAffine => "IA1001",
            Self::NotDivisible => "IA1002",
            Self::CannotDivideByIterator => "IA1003",
            Self::FuseFailed => "IA1004",
            Self::CannotDivSumWithBase => "IA1005",
            Self::InconsistentOffset => "IA2001",
            Self::UnnormalizablePredicate => "IA2002",
            Self::OverlappingConstraints => "IA2003",
            Self::IncompleteSplit => "IA3001",
            Self::UncoveredMark => "IA3002",
            Self::NotIndependent => "IA3003",
        }
    }
}

/// One diagnostic record: a typed kind, a rendered message, optional notes.
#[derive(Debug, Clone)]
pub struct Diag {
    pub kind: DiagKind,
    pub message: String,
    pub notes: Vec<String>,
}

impl Diag {
    pub fn new(kind: DiagKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            notes: Vec::new(),
        }
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn display(&self) {
        let color = color_enabled_stdout();
        let code = self.kind.code();
        println!(
            "{}",
            style(
                color,
                palette_for_code(code),
                &format!("error[{}]: {}", code, self.message),
            )
        );
        for n in &self.notes {
            println!("{}", style(color, "1;92", &format!("    hint: {}", n)));
        }
    }
}

/// Per-invocation diagnostic sink.
///
/// `unresolved_count` counts failed rewrites; plain emissions (context around
/// a failure that is counted elsewhere) do not touch it. Entry points check
/// the counter at their checkpoints and abort with an empty result when it is
/// non-zero.
#[derive(Debug, Default)]
pub struct DiagSink {
    diags: Vec<Diag>,
    unresolved: usize,
}

impl DiagSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record context without marking a rewrite as failed.
    pub fn emit(&mut self, diag: Diag) {
        self.diags.push(diag);
    }

    /// Record a failed rewrite.
    pub fn fail(&mut self, diag: Diag) {
        self.unresolved += 1;
        self.diags.push(diag);
    }

    pub fn unresolved_count(&self) -> usize {
        self.unresolved
    }

    pub fn diags(&self) -> &[Diag] {
        &self.diags
    }

    pub fn is_empty(&self) -> bool {
        self.diags.is_empty()
    }

    pub fn has_kind(&self, kind: DiagKind) -> bool {
        self.diags.iter().any(|d| d.kind == kind)
    }

    pub fn display(&self) {
        for d in &self.diags {
            d.display();
        }
    }
}

fn palette_for_code(code: &str) -> &'static str {
    if code.starts_with("IA0") {
        "1;35"
    } else if code.starts_with("IA1") {
        "1;33"
    } else if code.starts_with("IA2") {
        "1;36"
    } else {
        "1;31"
    }
}

fn color_enabled_stdout() -> bool {
    let no_color = env::var_os("NO_COLOR").is_some();
    let force_color = env::var_os("IA_FORCE_COLOR").is_some();
    let is_tty = std::io::stdout().is_terminal();
    (is_tty && !no_color) || (force_color && !no_color)
}

fn style(color: bool, code: &str, text: &str) -> String {
    if color {
        format!("\x1b[{}m{}\x1b[0m", code, text)
    } else {
        text.to_string()
    }
}
