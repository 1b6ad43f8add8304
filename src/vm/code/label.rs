use crate::vm::Error;
use std::fmt;

/// Opaque label, local to one method
///
/// Labels are indices into the method's [`LabelTable`], so they are cheap to copy and compare.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Label(usize);

impl Label {
    /// Label for the first instruction in the method
    pub const ENTRY: Label = Label(0);

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Debug for Label {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_fmt(format_args!("L{}", self.0))
    }
}

impl fmt::Display for Label {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, formatter)
    }
}

/// Tracks which instruction every label of a method points to, and which instructions refer to
/// the label
///
/// Positions and reference sites are instruction indices (not byte addresses: those only exist
/// after linking). A label may be placed at `len()` of its method while code is still being
/// emitted, but by the time the method is linked there must be an instruction at that position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelTable {
    entries: Vec<LabelEntry>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct LabelEntry {
    position: Option<usize>,
    references: Vec<usize>,
}

impl LabelTable {
    /// New table containing just the entry label, placed at position 0
    pub fn new() -> LabelTable {
        LabelTable {
            entries: vec![LabelEntry {
                position: Some(0),
                references: vec![],
            }],
        }
    }

    /// Get a fresh unplaced label
    pub fn create(&mut self) -> Label {
        self.entries.push(LabelEntry::default());
        Label(self.entries.len() - 1)
    }

    fn entry_mut(&mut self, label: Label) -> Result<&mut LabelEntry, Error> {
        self.entries
            .get_mut(label.0)
            .ok_or(Error::UnknownLabel(label))
    }

    /// Bind a label to an instruction position
    pub fn place(&mut self, label: Label, position: usize) -> Result<(), Error> {
        let entry = self.entry_mut(label)?;
        if entry.position.is_some() {
            return Err(Error::LabelAlreadyPlaced(label));
        }
        entry.position = Some(position);
        Ok(())
    }

    /// Record that the instruction at `site` refers to the label
    pub fn reference(&mut self, label: Label, site: usize) -> Result<(), Error> {
        self.entry_mut(label)?.references.push(site);
        Ok(())
    }

    /// Forget that the instruction at `site` refers to the label
    pub fn unreference(&mut self, label: Label, site: usize) -> Result<(), Error> {
        let entry = self.entry_mut(label)?;
        if let Some(idx) = entry.references.iter().position(|s| *s == site) {
            entry.references.swap_remove(idx);
        }
        Ok(())
    }

    pub fn position(&self, label: Label) -> Option<usize> {
        self.entries.get(label.0).and_then(|entry| entry.position)
    }

    pub fn is_placed(&self, label: Label) -> bool {
        self.position(label).is_some()
    }

    /// Instruction positions that refer to the label
    pub fn references(&self, label: Label) -> &[usize] {
        self.entries
            .get(label.0)
            .map(|entry| entry.references.as_slice())
            .unwrap_or(&[])
    }

    /// Labels which are referred to but not placed
    pub fn unplaced(&self) -> impl Iterator<Item = Label> + '_ {
        self.iter()
            .filter(|(label, position)| position.is_none() && !self.references(*label).is_empty())
            .map(|(label, _)| label)
    }

    /// All labels, along with their positions
    pub fn iter(&self) -> impl Iterator<Item = (Label, Option<usize>)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .map(|(idx, entry)| (Label(idx), entry.position))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Move label positions and drop references, given a map from old instruction positions to
    /// new ones
    ///
    /// `remap` must be monotone. Removed sites (mapped to `None`) are dropped from the
    /// references. Positions are mapped with `remap_position` (which should send removed
    /// positions to the next kept instruction).
    pub(crate) fn remap(
        &mut self,
        remap_position: impl Fn(usize) -> usize,
        remap_site: impl Fn(usize) -> Option<usize>,
    ) {
        for entry in &mut self.entries {
            entry.position = entry.position.map(&remap_position);
            entry.references = entry
                .references
                .iter()
                .filter_map(|site| remap_site(*site))
                .collect();
        }
    }
}

impl Default for LabelTable {
    fn default() -> Self {
        LabelTable::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn place_once() {
        let mut table = LabelTable::new();
        assert_eq!(table.position(Label::ENTRY), Some(0));
        let l1 = table.create();
        assert_ne!(l1, Label::ENTRY);
        table.reference(l1, 3).unwrap();
        assert_eq!(table.unplaced().collect::<Vec<_>>(), vec![l1]);

        table.place(l1, 7).unwrap();
        assert_eq!(table.position(l1), Some(7));
        assert!(matches!(
            table.place(l1, 8),
            Err(Error::LabelAlreadyPlaced(l)) if l == l1
        ));
        assert_eq!(table.unplaced().count(), 0);
    }

    #[test]
    fn references_before_and_after_placing() {
        let mut table = LabelTable::new();
        let l1 = table.create();
        table.reference(l1, 0).unwrap();
        table.place(l1, 2).unwrap();
        table.reference(l1, 5).unwrap();
        assert_eq!(table.references(l1), &[0, 5]);

        table.unreference(l1, 0).unwrap();
        assert_eq!(table.references(l1), &[5]);
    }

    #[test]
    fn foreign_label() {
        let mut big = LabelTable::new();
        let _ = big.create();
        let foreign = big.create();
        let mut small = LabelTable::new();
        assert!(matches!(
            small.place(foreign, 0),
            Err(Error::UnknownLabel(_))
        ));
    }
}
