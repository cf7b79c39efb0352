use std::fmt;

use super::error::PolarError;
use super::terms::{InstanceLiteral, Pattern, Symbol, Term, Value};

#[derive(Debug)]
pub enum Warning {
    SingletonVariable { term: Term, sym: Symbol },
    UnknownSpecializer { term: Term },
    UndefinedRuleCall { term: Term },
}

impl Warning {
    pub fn term(&self) -> &Term {
        match self {
            Self::SingletonVariable { term, .. }
            | Self::UnknownSpecializer { term }
            | Self::UndefinedRuleCall { term } => term,
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Warning::*;
        match self {
            SingletonVariable { sym, .. } => write!(
                f,
                "Singleton variable {} is unused or undefined; try renaming to _{} or _",
                sym, sym
            )?,
            UnknownSpecializer { term } => {
                write!(f, "Unknown specializer {}", term)?;
                if let Some(suggestion) = common_specializer_misspellings(term) {
                    write!(f, ", did you mean {}?", suggestion)?;
                }
            }
            UndefinedRuleCall { term } => write!(f, "Call to undefined rule: {}", term)?,
        }
        if let Some(location) = self.term().location() {
            write!(f, "{}", location)?;
        }
        Ok(())
    }
}

fn common_specializer_misspellings(term: &Term) -> Option<&str> {
    if let Value::Pattern(Pattern::Instance(InstanceLiteral { tag, .. })) = term.value() {
        let misspelled_type = match tag.0.as_ref() {
            "integer" | "int" | "i32" | "i64" | "u32" | "u64" | "usize" => "Integer",
            "float" | "f32" | "f64" | "double" => "Float",
            "char" | "str" | "string" => "String",
            "list" | "array" | "Array" | "Vec" => "List",
            "dict" | "Dict" | "dictionary" | "hash" | "Hash" | "map" | "Map" | "HashMap" => {
                "Dictionary"
            }
            "bool" | "boolean" => "Boolean",
            _ => return None,
        };
        return Some(misspelled_type);
    }
    None
}

/// Something found while loading a policy: either an error that aborts the load,
/// or a warning that is reported on the message queue.
#[derive(Debug)]
pub enum Diagnostic {
    Error(PolarError),
    Warning(Warning),
}

impl Diagnostic {
    pub fn is_error(&self) -> bool {
        matches!(self, Diagnostic::Error(_))
    }
}

impl From<PolarError> for Diagnostic {
    fn from(err: PolarError) -> Self {
        Self::Error(err)
    }
}

impl From<Warning> for Diagnostic {
    fn from(warning: Warning) -> Self {
        Self::Warning(warning)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self {
            Diagnostic::Error(e) => write!(f, "{}", e)?,
            Diagnostic::Warning(w) => write!(f, "{}", w)?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::sources::Location;

    #[test]
    fn test_warning_messages() {
        let location = Arc::new(Location::new(Some("app.polar".to_owned()), 3, 0));
        let term = Term::new_from_policy(location, value!(sym!("x")));
        let warning = Warning::SingletonVariable {
            term,
            sym: sym!("x"),
        };
        assert_eq!(
            warning.to_string(),
            "Singleton variable x is unused or undefined; try renaming to _x or _ at line 4, column 1 in file app.polar"
        );

        let specializer = Warning::UnknownSpecializer {
            term: term!(pattern!(instance!("int"))),
        };
        assert_eq!(
            Diagnostic::from(specializer).to_string(),
            "Unknown specializer int{}, did you mean Integer?"
        );
    }
}
