//! Correlation between script addresses and source positions

use super::code::LinkedProgram;
use crate::util::Offset;
use std::fmt;

/// Range of source text (lines and columns are 1-based)
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SourceSpan {
    /// Index of the source document
    pub document: u16,
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

impl SourceSpan {
    pub fn new(
        document: u16,
        start_line: u32,
        start_column: u32,
        end_line: u32,
        end_column: u32,
    ) -> SourceSpan {
        SourceSpan {
            document,
            start_line,
            start_column,
            end_line,
            end_column,
        }
    }
}

/// Renders as `[doc]sl:sc-el:ec`
impl fmt::Display for SourceSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}]{}:{}-{}:{}",
            self.document, self.start_line, self.start_column, self.end_line, self.end_column
        )
    }
}

/// Source position of the instruction at some address
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SequencePoint {
    pub address: Offset,
    pub span: SourceSpan,
}

/// Renders as `addr[doc]sl:sc-el:ec`
impl fmt::Display for SequencePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.address.0, self.span)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodDebugInfo {
    pub name: String,

    /// Address of the first instruction
    pub start: Offset,

    /// Address of the last instruction
    pub end: Offset,

    /// Ordered by address
    pub sequence_points: Vec<SequencePoint>,
}

/// Debug map of a whole program
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DebugInfo {
    pub methods: Vec<MethodDebugInfo>,
}

impl DebugInfo {
    pub fn from_program(program: &LinkedProgram) -> DebugInfo {
        let methods = program
            .methods
            .iter()
            .map(|method| {
                let start = method.instructions.initial_offset();
                let end = method
                    .instructions
                    .iter()
                    .last()
                    .map_or(start, |(offset, _, _)| offset);
                MethodDebugInfo {
                    name: method.name.clone(),
                    start,
                    end,
                    sequence_points: method.sequence_points.clone(),
                }
            })
            .collect();
        DebugInfo { methods }
    }

    /// Find the sequence point covering an address (the last one at or before it, in the
    /// method containing the address)
    pub fn lookup(&self, address: Offset) -> Option<(&MethodDebugInfo, &SequencePoint)> {
        let method = self
            .methods
            .iter()
            .find(|method| method.start <= address && address <= method.end)?;
        let point = method
            .sequence_points
            .iter()
            .take_while(|point| point.address <= address)
            .last()?;
        Some((method, point))
    }
}

/// One line per method: `name start-end` followed by its sequence points
impl fmt::Display for DebugInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for method in &self.methods {
            write!(f, "{} {}-{}", method.name, method.start.0, method.end.0)?;
            for point in &method.sequence_points {
                write!(f, " {}", point)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
