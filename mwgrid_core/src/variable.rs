//! Variable descriptors and the kernel's built-in variables.

use crate::error::{KernelError, KernelResult};
use mwgrid_env::{Value, ValueType, VariableId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which store owns a variable's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Visibility {
    /// Lives in the shared store; readable (and writable) by other agents.
    Public,
    /// Lives in the owning agent's private store only.
    Private,
}

/// Static description of a variable.
///
/// Descriptors are plain constants; visibility is declared alongside the id
/// and type rather than discovered at run time.
///
/// ```ignore
/// const ENERGY: Variable = Variable::private(20, "ENERGY", ValueType::Double);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Variable {
    pub id: VariableId,
    pub name: &'static str,
    pub value_type: ValueType,
    pub visibility: Visibility,
}

impl Variable {
    pub const fn public(id: VariableId, name: &'static str, value_type: ValueType) -> Self {
        Self {
            id,
            name,
            value_type,
            visibility: Visibility::Public,
        }
    }

    pub const fn private(id: VariableId, name: &'static str, value_type: ValueType) -> Self {
        Self {
            id,
            name,
            value_type,
            visibility: Visibility::Private,
        }
    }

    pub fn is_public(&self) -> bool {
        self.visibility == Visibility::Public
    }

    /// Fails with `TypeMismatch` unless `value` has the declared type.
    pub fn check(&self, value: &Value) -> KernelResult<()> {
        let found = value.value_type();
        if found == self.value_type {
            Ok(())
        } else {
            Err(KernelError::TypeMismatch {
                variable: self.id,
                expected: self.value_type,
                found,
            })
        }
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.id)
    }
}

/// Variables every agent carries, plus the ones the kernel itself interprets.
///
/// Application variables should use ids above [`kernel_vars::RESERVED`].
pub mod kernel_vars {
    use super::Variable;
    use mwgrid_env::{ValueType, VariableId};

    /// Behavior class id. Registered for every agent; read by the liveness ping.
    pub const CLASS: Variable = Variable::public(1, "CLASS", ValueType::Int);

    /// Encoded mailbox. Registered for every agent, initially [`EMPTY_MAILBOX`](crate::mailbox::EMPTY_MAILBOX).
    pub const MESSAGES: Variable = Variable::public(2, "MESSAGES", ValueType::Text);

    /// Position on the grid; the variable range queries scan.
    pub const LOCATION: Variable = Variable::public(3, "LOCATION", ValueType::Location);

    /// Previous position, kept privately by moving behaviors.
    pub const PREVIOUS: Variable = Variable::private(4, "PREVIOUS", ValueType::Location);

    /// Highest id reserved by the kernel.
    pub const RESERVED: VariableId = 9;
}
