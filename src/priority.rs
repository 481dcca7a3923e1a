//! Priority and category definitions plus the lookup tables used across all scheduler stages.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Index, IndexMut};

/// Urgency classes ordered from most to least critical.
///
/// The ordering is stable so the lanes, dispatcher and monitor can rely on integer indexes
/// instead of branching on specific labels. Critical and High carry hard deadlines and are
/// relayed one by one; Normal and Low carry soft targets and are batched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    /// Ordered list of all priorities (critical → low) for iteration utilities.
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Priorities relayed individually on every dispatch tick.
    pub const RELAYED: [Priority; 2] = [Priority::Critical, Priority::High];

    /// Priorities grouped into batches by the adaptive batcher.
    pub const BATCHED: [Priority; 2] = [Priority::Normal, Priority::Low];

    /// Stable index for priority based arrays.
    pub const fn index(self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    /// Whether events of this class carry a hard deadline.
    pub const fn has_hard_deadline(self) -> bool {
        matches!(self, Priority::Critical | Priority::High)
    }

    /// Whether events of this class are grouped into batches.
    pub const fn is_batched(self) -> bool {
        matches!(self, Priority::Normal | Priority::Low)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        };
        write!(f, "{label}")
    }
}

/// Consumer family an event is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Category {
    Audio,
    Visual,
    Parameter,
    Sync,
    UserInput,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Audio,
        Category::Visual,
        Category::Parameter,
        Category::Sync,
        Category::UserInput,
    ];

    pub const fn index(self) -> usize {
        match self {
            Category::Audio => 0,
            Category::Visual => 1,
            Category::Parameter => 2,
            Category::Sync => 3,
            Category::UserInput => 4,
        }
    }

    /// Largest payload accepted for this category, in bytes.
    ///
    /// Sizes follow the kind of data each family carries: audio control blocks are the
    /// largest, sync pulses carry little more than a counter.
    pub const fn max_payload(self) -> usize {
        match self {
            Category::Audio => 1024,
            Category::Visual => 512,
            Category::Parameter => 64,
            Category::Sync => 16,
            Category::UserInput => 128,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Category::Audio => "audio",
            Category::Visual => "visual",
            Category::Parameter => "parameter",
            Category::Sync => "sync",
            Category::UserInput => "user_input",
        };
        write!(f, "{label}")
    }
}

/// Helper structure wrapping a value per [`Priority`].
///
/// This allows APIs to remain stable when new priorities are introduced: as long as
/// [`Priority::ALL`] is updated, the table automatically grows and all call sites iterate
/// dynamically. Serialized as a plain list in [`Priority::ALL`] order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<T>", into = "Vec<T>", bound(serialize = "T: Clone + Serialize", deserialize = "T: Deserialize<'de>"))]
pub struct PriorityTable<T> {
    values: Vec<T>,
}

impl<T> PriorityTable<T> {
    /// Build a table by executing a closure for each priority.
    ///
    /// The closure is called once per priority in [`Priority::ALL`] order (Critical, High,
    /// Normal, Low), so construction order is deterministic.
    ///
    /// # Example
    /// ```
    /// use frame_scheduler::priority::{Priority, PriorityTable};
    ///
    /// let capacities = PriorityTable::from_fn(|priority| match priority {
    ///     Priority::Critical => 256,
    ///     _ => 4096,
    /// });
    /// assert_eq!(capacities[Priority::Low], 4096);
    /// ```
    pub fn from_fn(mut f: impl FnMut(Priority) -> T) -> Self {
        let mut values = Vec::with_capacity(Priority::ALL.len());
        for priority in Priority::ALL {
            values.push(f(priority));
        }
        PriorityTable { values }
    }

    /// Borrow the value for a given priority.
    pub fn get(&self, priority: Priority) -> &T {
        &self.values[priority.index()]
    }

    /// Mutably borrow the value for a given priority.
    pub fn get_mut(&mut self, priority: Priority) -> &mut T {
        &mut self.values[priority.index()]
    }

    /// Iterate `(priority, value)` pairs in [`Priority::ALL`] order.
    pub fn iter(&self) -> impl Iterator<Item = (Priority, &T)> {
        Priority::ALL.into_iter().zip(self.values.iter())
    }

    /// Build a new table by mapping every entry.
    pub fn map<U>(&self, mut f: impl FnMut(Priority, &T) -> U) -> PriorityTable<U> {
        PriorityTable::from_fn(|priority| f(priority, &self.values[priority.index()]))
    }
}

impl<T> TryFrom<Vec<T>> for PriorityTable<T> {
    type Error = String;

    fn try_from(values: Vec<T>) -> Result<Self, Self::Error> {
        if values.len() != Priority::ALL.len() {
            return Err(format!(
                "priority table expects {} entries, got {}",
                Priority::ALL.len(),
                values.len()
            ));
        }
        Ok(PriorityTable { values })
    }
}

impl<T> From<PriorityTable<T>> for Vec<T> {
    fn from(table: PriorityTable<T>) -> Self {
        table.values
    }
}

impl<T> Index<Priority> for PriorityTable<T> {
    type Output = T;

    fn index(&self, index: Priority) -> &Self::Output {
        self.get(index)
    }
}

impl<T> IndexMut<Priority> for PriorityTable<T> {
    fn index_mut(&mut self, index: Priority) -> &mut Self::Output {
        self.get_mut(index)
    }
}

/// Same idea as [`PriorityTable`], keyed by [`Category`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<T>", into = "Vec<T>", bound(serialize = "T: Clone + Serialize", deserialize = "T: Deserialize<'de>"))]
pub struct CategoryTable<T> {
    values: Vec<T>,
}

impl<T> CategoryTable<T> {
    pub fn from_fn(mut f: impl FnMut(Category) -> T) -> Self {
        let mut values = Vec::with_capacity(Category::ALL.len());
        for category in Category::ALL {
            values.push(f(category));
        }
        CategoryTable { values }
    }

    pub fn get(&self, category: Category) -> &T {
        &self.values[category.index()]
    }

    pub fn get_mut(&mut self, category: Category) -> &mut T {
        &mut self.values[category.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (Category, &T)> {
        Category::ALL.into_iter().zip(self.values.iter())
    }

    pub fn map<U>(&self, mut f: impl FnMut(Category, &T) -> U) -> CategoryTable<U> {
        CategoryTable::from_fn(|category| f(category, &self.values[category.index()]))
    }
}

impl<T> TryFrom<Vec<T>> for CategoryTable<T> {
    type Error = String;

    fn try_from(values: Vec<T>) -> Result<Self, Self::Error> {
        if values.len() != Category::ALL.len() {
            return Err(format!(
                "category table expects {} entries, got {}",
                Category::ALL.len(),
                values.len()
            ));
        }
        Ok(CategoryTable { values })
    }
}

impl<T> From<CategoryTable<T>> for Vec<T> {
    fn from(table: CategoryTable<T>) -> Self {
        table.values
    }
}

impl<T> Index<Category> for CategoryTable<T> {
    type Output = T;

    fn index(&self, index: Category) -> &Self::Output {
        self.get(index)
    }
}

impl<T> IndexMut<Category> for CategoryTable<T> {
    fn index_mut(&mut self, index: Category) -> &mut Self::Output {
        self.get_mut(index)
    }
}
