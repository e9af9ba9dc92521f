//! Authoritative in-memory board.
//!
//! The board is a dense `width × height` grid stored row-major. It is owned
//! by the engine task and never shared: every read and write goes through
//! that single owner, which is what makes snapshots consistent with the
//! writes that preceded them.

use crate::protocol::{Color, Grid, RejectReason, Rejection};
use crate::storage::{BoardMetadata, BoardStore, CellRecord, StoreError};

/// Board dimensions and fill color.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardConfig {
    pub width: u32,
    pub height: u32,
    pub default_color: Color,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            width: 70,
            height: 50,
            default_color: Color::white(),
        }
    }
}

impl BoardConfig {
    pub fn new(width: u32, height: u32, default_color: Color) -> Self {
        Self {
            width,
            height,
            default_color,
        }
    }

    pub fn validate(&self) -> Result<(), StartupError> {
        if self.width == 0 || self.height == 0 {
            return Err(StartupError::InvalidConfig(format!(
                "board dimensions must be non-zero, got {}×{}",
                self.width, self.height
            )));
        }
        if (self.width as u64) * (self.height as u64) > u32::MAX as u64 {
            return Err(StartupError::InvalidConfig(format!(
                "board {}×{} is too large",
                self.width, self.height
            )));
        }
        Ok(())
    }
}

/// What [`Board::initialize`] found and did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitReport {
    /// Cells restored from the store
    pub loaded: usize,
    /// Missing cells filled with the default color and persisted
    pub filled: usize,
    /// Stored cells outside the configured dimensions
    pub ignored: usize,
}

/// Dense grid of cell colors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Board {
    width: u32,
    height: u32,
    cells: Vec<Color>,
}

impl Board {
    /// Board filled with `config.default_color`, without touching any store.
    pub fn new(config: &BoardConfig) -> Result<Self, StartupError> {
        config.validate()?;
        let len = config.width as usize * config.height as usize;
        Ok(Self {
            width: config.width,
            height: config.height,
            cells: vec![config.default_color.clone(); len],
        })
    }

    /// Load the board from `store`, provisioning any coordinate the store
    /// does not have.
    ///
    /// Existing cells are never overwritten, so running this against an
    /// already-populated store is a no-op apart from the scan. Stored cells
    /// outside the configured dimensions are left in the store and ignored.
    /// Any store failure is fatal: the caller must not start serving.
    pub fn initialize(
        config: &BoardConfig,
        store: &dyn BoardStore,
    ) -> Result<(Self, InitReport), StartupError> {
        let mut board = Self::new(config)?;
        let mut present = vec![false; board.cells.len()];
        let mut report = InitReport::default();

        for cell in store.scan_all()? {
            match board.index(cell.x as i64, cell.y as i64) {
                Some(idx) => {
                    if !present[idx] {
                        report.loaded += 1;
                    }
                    present[idx] = true;
                    board.cells[idx] = cell.color;
                }
                None => report.ignored += 1,
            }
        }

        let missing: Vec<CellRecord> = present
            .iter()
            .enumerate()
            .filter(|&(_, &found)| !found)
            .map(|(idx, _)| {
                let (x, y) = board.coords(idx);
                CellRecord::new(x, y, config.default_color.clone())
            })
            .collect();

        if !missing.is_empty() {
            store.upsert_batch(&missing)?;
            report.filled = missing.len();
        }

        let metadata = match store.load_metadata()? {
            Some(mut existing) => {
                existing.width = config.width;
                existing.height = config.height;
                existing.default_color = config.default_color.clone();
                existing.updated_at = crate::storage::unix_secs();
                existing
            }
            None => BoardMetadata::new(config.width, config.height, config.default_color.clone()),
        };
        store.save_metadata(&metadata)?;

        if report.ignored > 0 {
            log::warn!(
                "{} stored cells lie outside the {}×{} board and were ignored",
                report.ignored,
                config.width,
                config.height
            );
        }

        Ok((board, report))
    }

    /// Full grid as `height` rows of `width` colors.
    pub fn get_snapshot(&self) -> Grid {
        self.cells
            .chunks(self.width as usize)
            .map(|row| row.to_vec())
            .collect()
    }

    /// Color at `(x, y)`, or `None` outside the board.
    pub fn get(&self, x: i64, y: i64) -> Option<&Color> {
        self.index(x, y).map(|idx| &self.cells[idx])
    }

    /// Validate that `(x, y)` lies inside the board.
    pub fn check_bounds(&self, x: i64, y: i64) -> Result<(u32, u32), MutationError> {
        match self.index(x, y) {
            Some(_) => Ok((x as u32, y as u32)),
            None => Err(MutationError::OutOfBounds {
                x,
                y,
                width: self.width,
                height: self.height,
            }),
        }
    }

    /// Overwrite the cell at `(x, y)` and return the color it replaced.
    ///
    /// Last write wins: there is no comparison against the previous color.
    pub fn set_cell(&mut self, x: i64, y: i64, color: Color) -> Result<Color, MutationError> {
        self.check_bounds(x, y)?;
        let idx = y as usize * self.width as usize + x as usize;
        Ok(std::mem::replace(&mut self.cells[idx], color))
    }

    fn index(&self, x: i64, y: i64) -> Option<usize> {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return None;
        }
        Some(y as usize * self.width as usize + x as usize)
    }

    fn coords(&self, idx: usize) -> (u32, u32) {
        let width = self.width as usize;
        ((idx % width) as u32, (idx / width) as u32)
    }
}

/// Why a mutation request was not applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationError {
    OutOfBounds {
        x: i64,
        y: i64,
        width: u32,
        height: u32,
    },
    InvalidColor(String),
    /// The session is unknown or has not received its snapshot yet
    NotSynced,
}

impl MutationError {
    pub fn reason(&self) -> RejectReason {
        match self {
            Self::OutOfBounds { .. } => RejectReason::OutOfBounds,
            Self::InvalidColor(_) => RejectReason::InvalidColor,
            Self::NotSynced => RejectReason::NotSynced,
        }
    }

    /// Acknowledgment for the session that sent the request at `(x, y)`.
    pub fn to_rejection(&self, x: i64, y: i64) -> Rejection {
        Rejection {
            reason: self.reason(),
            message: self.to_string(),
            x: Some(x),
            y: Some(y),
        }
    }
}

impl std::fmt::Display for MutationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfBounds {
                x,
                y,
                width,
                height,
            } => write!(f, "Cell ({x}, {y}) is outside the {width}×{height} board"),
            Self::InvalidColor(c) => write!(f, "Invalid color {c:?}, expected #RRGGBB"),
            Self::NotSynced => write!(f, "Session has not completed its initial sync"),
        }
    }
}

impl std::error::Error for MutationError {}

/// Failures that prevent the board from being brought up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupError {
    /// Initial load or provisioning against the store failed
    Persistence(StoreError),
    InvalidConfig(String),
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Persistence(e) => write!(f, "Startup persistence failure: {e}"),
            Self::InvalidConfig(e) => write!(f, "Invalid board configuration: {e}"),
        }
    }
}

impl std::error::Error for StartupError {}

impl From<StoreError> for StartupError {
    fn from(e: StoreError) -> Self {
        StartupError::Persistence(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn red() -> Color {
        Color::parse("#FF0000").unwrap()
    }

    fn config(width: u32, height: u32) -> BoardConfig {
        BoardConfig::new(width, height, Color::white())
    }

    #[test]
    fn test_initialize_empty_store_fills_and_persists() {
        let store = MemoryStore::new();
        let (board, report) = Board::initialize(&config(3, 2), &store).unwrap();

        assert_eq!(report, InitReport { loaded: 0, filled: 6, ignored: 0 });
        assert_eq!(store.cell_count(), 6);
        assert!(board.get_snapshot().iter().flatten().all(|c| *c == Color::white()));
        assert_eq!(store.load_metadata().unwrap().unwrap().width, 3);
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let store = MemoryStore::new();
        Board::initialize(&config(3, 2), &store).unwrap();
        store.upsert(1, 1, &red()).unwrap();

        let (board, report) = Board::initialize(&config(3, 2), &store).unwrap();
        assert_eq!(report, InitReport { loaded: 6, filled: 0, ignored: 0 });
        assert_eq!(store.cell_count(), 6);
        assert_eq!(board.get(1, 1), Some(&red()));
    }

    #[test]
    fn test_initialize_grows_smaller_store() {
        let store = MemoryStore::new();
        Board::initialize(&config(2, 2), &store).unwrap();
        store.upsert(0, 0, &red()).unwrap();

        let (board, report) = Board::initialize(&config(4, 3), &store).unwrap();
        assert_eq!(report.loaded, 4);
        assert_eq!(report.filled, 8);
        assert_eq!(store.cell_count(), 12);
        assert_eq!(board.get(0, 0), Some(&red()));
        assert_eq!(board.get(3, 2), Some(&Color::white()));
    }

    #[test]
    fn test_initialize_ignores_out_of_range_cells() {
        let store = MemoryStore::new();
        store.upsert(10, 10, &red()).unwrap();

        let (board, report) = Board::initialize(&config(2, 2), &store).unwrap();
        assert_eq!(report.ignored, 1);
        assert_eq!(board.get(10, 10), None);
        // Left in place for a later re-provisioning
        assert_eq!(store.get(10, 10), Some(red()));
    }

    #[test]
    fn test_initialize_rejects_zero_dimensions() {
        let store = MemoryStore::new();
        let err = Board::initialize(&config(0, 5), &store).unwrap_err();
        assert!(matches!(err, StartupError::InvalidConfig(_)));
        assert_eq!(store.cell_count(), 0);
    }

    #[test]
    fn test_new_rejects_degenerate_dimensions() {
        for (width, height) in [(0, 3), (3, 0), (0, 0), (u32::MAX, 2)] {
            assert!(matches!(
                Board::new(&config(width, height)),
                Err(StartupError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn test_set_cell_returns_previous() {
        let mut board = Board::new(&config(3, 2)).unwrap();
        let previous = board.set_cell(1, 0, red()).unwrap();
        assert_eq!(previous, Color::white());

        let previous = board.set_cell(1, 0, Color::white()).unwrap();
        assert_eq!(previous, red());
    }

    #[test]
    fn test_set_cell_bounds() {
        let mut board = Board::new(&config(3, 2)).unwrap();
        for (x, y) in [(3, 0), (0, 2), (-1, 0), (0, -1), (i64::MAX, 0)] {
            let err = board.set_cell(x, y, red()).unwrap_err();
            assert_eq!(err.reason(), RejectReason::OutOfBounds);
        }
        assert_eq!(board, Board::new(&config(3, 2)).unwrap());
    }

    #[test]
    fn test_snapshot_layout_is_rows_of_columns() {
        let mut board = Board::new(&config(3, 2)).unwrap();
        board.set_cell(1, 0, red()).unwrap();

        let w = Color::white();
        assert_eq!(
            board.get_snapshot(),
            vec![vec![w.clone(), red(), w.clone()], vec![w.clone(), w.clone(), w]]
        );
    }

    #[test]
    fn test_rejection_carries_coordinates() {
        let err = MutationError::InvalidColor("teal".into());
        let rejection = err.to_rejection(4, 5);
        assert_eq!(rejection.reason, RejectReason::InvalidColor);
        assert_eq!((rejection.x, rejection.y), (Some(4), Some(5)));
        assert!(rejection.message.contains("teal"));
    }
}
