#![forbid(unsafe_code)]

use std::fmt;

use ft_schema_info::{SchemaArgument, SchemaInfo, SchemaInfoError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Strict,
    Hardened,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvidenceKind {
    Schema,
    Mutation,
    Alias,
    Policy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceEntry {
    pub ts_unix_ms: u128,
    pub kind: EvidenceKind,
    pub summary: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvidenceLedger {
    entries: Vec<EvidenceEntry>,
}

impl EvidenceLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: EvidenceKind, summary: impl Into<String>) {
        self.entries.push(EvidenceEntry {
            ts_unix_ms: now_unix_ms(),
            kind,
            summary: summary.into(),
        });
    }

    #[must_use]
    pub fn entries(&self) -> &[EvidenceEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Identity of the storage buffer backing one actual argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageId(pub u64);

/// Pair of input positions where a mutated input shares storage with
/// another input and the schema does not document the overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageConflict {
    pub mutated: usize,
    pub other: usize,
    pub storage: StorageId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InplaceDecision {
    pub op: String,
    pub mode: ExecutionMode,
    pub mutated_inputs: Vec<usize>,
    pub conflicts: Vec<StorageConflict>,
    pub copy_required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InplaceError {
    Query(SchemaInfoError),
    StorageArityMismatch { expected: usize, actual: usize },
    UndeclaredOverlap { op: String, conflict: StorageConflict },
}

impl fmt::Display for InplaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Query(error) => write!(f, "schema query failure: {error}"),
            Self::StorageArityMismatch { expected, actual } => write!(
                f,
                "storage list does not match schema inputs: expected={expected} actual={actual}"
            ),
            Self::UndeclaredOverlap { op, conflict } => write!(
                f,
                "strict mode forbids undeclared overlap in {op}: mutated input {} shares storage {} with input {}",
                conflict.mutated, conflict.storage.0, conflict.other
            ),
        }
    }
}

impl std::error::Error for InplaceError {}

impl From<SchemaInfoError> for InplaceError {
    fn from(value: SchemaInfoError) -> Self {
        Self::Query(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContext {
    mode: ExecutionMode,
    ledger: EvidenceLedger,
}

impl RuntimeContext {
    #[must_use]
    pub fn new(mode: ExecutionMode) -> Self {
        let mut ledger = EvidenceLedger::new();
        ledger.record(
            EvidenceKind::Policy,
            format!("mode initialized to {mode:?}"),
        );
        Self { mode, ledger }
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        self.mode = mode;
        self.ledger
            .record(EvidenceKind::Policy, format!("mode switched to {mode:?}"));
    }

    #[must_use]
    pub fn ledger(&self) -> &EvidenceLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut EvidenceLedger {
        &mut self.ledger
    }

    pub fn record_schema_load_failure<E>(&mut self, op: &str, error: &E)
    where
        E: fmt::Display + ?Sized,
    {
        self.ledger.record(
            EvidenceKind::Schema,
            format!("schema load failure op={op}: {error}"),
        );
    }

    /// Decides whether an invocation that writes through its inputs needs a
    /// defensive copy first. `storages` holds one entry per schema input;
    /// `None` marks arguments without backing storage.
    ///
    /// A mutated input sharing storage with another input is a conflict
    /// unless the schema documents the two slots as aliasing. Strict mode
    /// fails closed on the first conflict; hardened mode reports every
    /// conflict and asks for a copy.
    pub fn check_inplace(
        &mut self,
        info: &SchemaInfo,
        storages: &[Option<StorageId>],
    ) -> Result<InplaceDecision, InplaceError> {
        let op = info.schema().qualified_name();
        if storages.len() != info.num_inputs() {
            let error = InplaceError::StorageArityMismatch {
                expected: info.num_inputs(),
                actual: storages.len(),
            };
            self.ledger.record(
                EvidenceKind::Policy,
                format!("inplace check rejected op={op}: {error}"),
            );
            return Err(error);
        }

        let mutated_inputs = info.mutated_inputs();
        self.ledger.record(
            EvidenceKind::Mutation,
            format!("op={op} mutated_inputs={mutated_inputs:?}"),
        );

        let mut conflicts = Vec::new();
        for &mutated in &mutated_inputs {
            let Some(storage) = storages[mutated] else {
                continue;
            };
            for (other, candidate) in storages.iter().enumerate() {
                if other == mutated || *candidate != Some(storage) {
                    continue;
                }
                // A pair of mutated inputs is examined once, from its lower position.
                if other < mutated && mutated_inputs.contains(&other) {
                    continue;
                }
                let declared = info.are_aliasing(
                    SchemaArgument::input(mutated),
                    SchemaArgument::input(other),
                )?;
                if declared {
                    continue;
                }
                let conflict = StorageConflict {
                    mutated,
                    other,
                    storage,
                };
                self.ledger.record(
                    EvidenceKind::Alias,
                    format!(
                        "op={op} undeclared overlap mutated={mutated} other={other} storage={}",
                        storage.0
                    ),
                );
                if self.mode == ExecutionMode::Strict {
                    return Err(InplaceError::UndeclaredOverlap { op, conflict });
                }
                conflicts.push(conflict);
            }
        }

        let copy_required = !conflicts.is_empty();
        if copy_required {
            self.ledger.record(
                EvidenceKind::Policy,
                format!(
                    "op={op} hardened copy before write conflicts={}",
                    conflicts.len()
                ),
            );
        }

        Ok(InplaceDecision {
            op,
            mode: self.mode,
            mutated_inputs,
            conflicts,
            copy_required,
        })
    }
}

fn now_unix_ms() -> u128 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}

#[cfg(test)]
mod tests {
    use ft_schema::{AliasInfo, Argument, ArgumentType, FunctionSchema, decode_schema_json};
    use ft_schema_info::{SchemaInfo, SchemaInfoError};
    use proptest::prelude::*;

    use super::{EvidenceKind, ExecutionMode, InplaceError, RuntimeContext, StorageId};

    fn add_inplace() -> SchemaInfo {
        SchemaInfo::new(FunctionSchema::new(
            "aten::add_",
            "Tensor",
            vec![
                Argument::tensor("self").with_alias(AliasInfo::write("a")),
                Argument::tensor("other"),
                Argument::new("alpha", ArgumentType::Scalar).keyword_only(),
            ],
            vec![Argument::unnamed(ArgumentType::Tensor).with_alias(AliasInfo::write("a"))],
        ))
        .expect("add_ schema should load")
    }

    /// `self` and `src` are declared to share set `a`, so passing the same
    /// storage twice is documented behaviour.
    fn declared_overlap() -> SchemaInfo {
        SchemaInfo::new(FunctionSchema::new(
            "ft::blend_",
            "",
            vec![
                Argument::tensor("self").with_alias(AliasInfo::write("a")),
                Argument::tensor("src").with_alias(AliasInfo::read("a")),
            ],
            vec![Argument::unnamed(ArgumentType::Tensor).with_alias(AliasInfo::write("a"))],
        ))
        .expect("blend_ schema should load")
    }

    #[test]
    fn ledger_records_policy_and_custom_events() {
        let mut ctx = RuntimeContext::new(ExecutionMode::Strict);
        ctx.ledger_mut()
            .record(EvidenceKind::Alias, "alias decision");

        assert_eq!(ctx.ledger().len(), 2);
        assert_eq!(ctx.ledger().entries()[1].kind, EvidenceKind::Alias);
    }

    #[test]
    fn mode_switch_records_event() {
        let mut ctx = RuntimeContext::new(ExecutionMode::Strict);
        ctx.set_mode(ExecutionMode::Hardened);

        assert_eq!(ctx.mode(), ExecutionMode::Hardened);
        assert_eq!(ctx.ledger().len(), 2);
    }

    #[test]
    fn distinct_storages_need_no_copy() {
        let mut ctx = RuntimeContext::new(ExecutionMode::Strict);
        let decision = ctx
            .check_inplace(
                &add_inplace(),
                &[Some(StorageId(1)), Some(StorageId(2)), None],
            )
            .expect("distinct storages should pass");
        assert!(!decision.copy_required);
        assert_eq!(decision.mutated_inputs, vec![0]);
        assert_eq!(decision.op, "aten::add_.Tensor");
        assert!(
            ctx.ledger()
                .entries()
                .iter()
                .any(|entry| entry.kind == EvidenceKind::Mutation)
        );
    }

    #[test]
    fn strict_mode_rejects_undeclared_overlap() {
        let mut ctx = RuntimeContext::new(ExecutionMode::Strict);
        let err = ctx
            .check_inplace(
                &add_inplace(),
                &[Some(StorageId(7)), Some(StorageId(7)), None],
            )
            .expect_err("strict mode must fail closed");
        assert!(err.to_string().contains("strict mode forbids"));
        let InplaceError::UndeclaredOverlap { conflict, .. } = &err else {
            panic!("expected UndeclaredOverlap, got {err:?}");
        };
        assert_eq!((conflict.mutated, conflict.other), (0, 1));
        let alias_entry = ctx
            .ledger()
            .entries()
            .iter()
            .rev()
            .find(|entry| entry.kind == EvidenceKind::Alias)
            .expect("alias evidence entry should be present");
        assert!(alias_entry.summary.contains("undeclared overlap"));
    }

    #[test]
    fn hardened_mode_requests_copy() {
        let mut ctx = RuntimeContext::new(ExecutionMode::Hardened);
        let decision = ctx
            .check_inplace(
                &add_inplace(),
                &[Some(StorageId(7)), Some(StorageId(7)), None],
            )
            .expect("hardened mode should fall back to a copy");
        assert!(decision.copy_required);
        assert_eq!(decision.conflicts.len(), 1);
        assert_eq!(decision.mode, ExecutionMode::Hardened);
    }

    #[test]
    fn declared_overlap_is_allowed_in_strict_mode() {
        let mut ctx = RuntimeContext::new(ExecutionMode::Strict);
        let decision = ctx
            .check_inplace(&declared_overlap(), &[Some(StorageId(3)), Some(StorageId(3))])
            .expect("documented aliasing should pass");
        assert!(!decision.copy_required);
        assert!(decision.conflicts.is_empty());
    }

    #[test]
    fn two_mutated_inputs_sharing_storage_report_one_conflict() {
        let info = SchemaInfo::new(FunctionSchema::new(
            "ft::swap_",
            "",
            vec![
                Argument::tensor("x").with_alias(AliasInfo::write("a")),
                Argument::tensor("y").with_alias(AliasInfo::write("b")),
            ],
            Vec::new(),
        ))
        .expect("swap_ schema should load");
        let mut ctx = RuntimeContext::new(ExecutionMode::Hardened);
        let decision = ctx
            .check_inplace(&info, &[Some(StorageId(1)), Some(StorageId(1))])
            .expect("hardened mode should fall back to a copy");

        assert!(decision.copy_required);
        assert_eq!(decision.mutated_inputs, vec![0, 1]);
        assert_eq!(decision.conflicts.len(), 1);
        assert_eq!(
            (decision.conflicts[0].mutated, decision.conflicts[0].other),
            (0, 1)
        );
        let alias_entries = ctx
            .ledger()
            .entries()
            .iter()
            .filter(|entry| entry.kind == EvidenceKind::Alias)
            .count();
        assert_eq!(alias_entries, 1);
        assert!(
            ctx.ledger()
                .entries()
                .iter()
                .any(|entry| entry.summary.contains("conflicts=1"))
        );
    }

    #[test]
    fn mutated_input_overlapping_two_readers_reports_each_reader() {
        let info = SchemaInfo::new(FunctionSchema::new(
            "ft::accumulate_",
            "",
            vec![
                Argument::tensor("self").with_alias(AliasInfo::write("a")),
                Argument::tensor("lhs"),
                Argument::tensor("rhs"),
            ],
            Vec::new(),
        ))
        .expect("accumulate_ schema should load");
        let mut ctx = RuntimeContext::new(ExecutionMode::Hardened);
        let decision = ctx
            .check_inplace(
                &info,
                &[Some(StorageId(5)), Some(StorageId(5)), Some(StorageId(5))],
            )
            .expect("hardened mode should fall back to a copy");
        let pairs: Vec<_> = decision
            .conflicts
            .iter()
            .map(|conflict| (conflict.mutated, conflict.other))
            .collect();
        assert_eq!(pairs, vec![(0, 1), (0, 2)]);
    }

    #[test]
    fn storage_arity_mismatch_fails() {
        let mut ctx = RuntimeContext::new(ExecutionMode::Hardened);
        let err = ctx
            .check_inplace(&add_inplace(), &[Some(StorageId(1))])
            .expect_err("arity mismatch must fail");
        assert_eq!(
            err,
            InplaceError::StorageArityMismatch {
                expected: 3,
                actual: 1
            }
        );
    }

    #[test]
    fn schema_load_failure_records_evidence() {
        let mut ctx = RuntimeContext::new(ExecutionMode::Strict);
        let payload = r#"{"name": "aten::neg", "arguments": [], "returns": [], "extra": 1}"#;
        let err = decode_schema_json(payload).expect_err("unknown field must fail");
        let err = SchemaInfoError::from(err);
        ctx.record_schema_load_failure("aten::neg", &err);

        let entry = ctx
            .ledger()
            .entries()
            .iter()
            .rev()
            .find(|entry| entry.kind == EvidenceKind::Schema)
            .expect("schema evidence entry should be present");
        assert!(
            entry.summary.contains("unknown field"),
            "schema summary should include decode diagnostic: {}",
            entry.summary
        );
    }

    proptest! {
        #[test]
        fn prop_hardened_copy_iff_self_storage_shared(
            self_id in 0u64..4,
            other_id in 0u64..4,
        ) {
            let mut ctx = RuntimeContext::new(ExecutionMode::Hardened);
            let decision = ctx
                .check_inplace(
                    &add_inplace(),
                    &[Some(StorageId(self_id)), Some(StorageId(other_id)), None],
                )
                .expect("hardened check should not fail");
            prop_assert_eq!(decision.copy_required, self_id == other_id);
        }
    }
}
