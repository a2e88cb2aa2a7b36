//! Trial records — what each peer keeps once a trial's feedback is final.

use serde::{Deserialize, Serialize};

use crate::wire::{Category, Feedback, PeerRole, ResponseRecord, TrialParameters, GRID_SIDE};

/// Fraction of screen width the grid may occupy.
const GRID_WIDTH_FRACTION: f64 = 0.8;
/// Fraction of screen height the grid may occupy (room left for UI text).
const GRID_HEIGHT_FRACTION: f64 = 0.7;
/// Cell size as a fraction of cell spacing.
const CELL_FILL: f64 = 0.85;

// ── Spatial layout ────────────────────────────────────────────────────────────

/// One grid cell in screen coordinates (origin at screen centre, y up).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellLayout {
    pub position_index: u8,
    pub center_x: f64,
    pub center_y: f64,
    pub category: Category,
}

/// Where every cell of a trial's grid was drawn.
///
/// A pure function of the condition array and screen size, so both peers
/// arrive at the same layout without exchanging it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatialLayout {
    pub cell_size: u32,
    pub screen_dimensions: (u32, u32),
    pub cells: Vec<CellLayout>,
}

impl SpatialLayout {
    pub fn compute(params: &TrialParameters, screen: (u32, u32)) -> Self {
        let side = GRID_SIDE as f64;
        let spacing_x = screen.0 as f64 * GRID_WIDTH_FRACTION / side;
        let spacing_y = screen.1 as f64 * GRID_HEIGHT_FRACTION / side;
        let spacing = spacing_x.min(spacing_y);
        let cell_size = (spacing * CELL_FILL) as u32;

        let start_x = -(side - 1.0) * spacing / 2.0;
        let start_y = (side - 1.0) * spacing / 2.0;

        let cells = params
            .categories()
            .into_iter()
            .enumerate()
            .map(|(i, category)| {
                let row = (i / GRID_SIDE) as f64;
                let col = (i % GRID_SIDE) as f64;
                CellLayout {
                    position_index: i as u8,
                    center_x: start_x + col * spacing,
                    center_y: start_y - row * spacing,
                    category,
                }
            })
            .collect();

        Self {
            cell_size,
            screen_dimensions: screen,
            cells,
        }
    }

    pub fn cell(&self, position: u8) -> Option<&CellLayout> {
        self.cells.get(position as usize)
    }
}

// ── Scoring ───────────────────────────────────────────────────────────────────

/// One point when the first answer given names the target's category.
pub fn score(first_response: Option<Category>, correct: Category) -> u32 {
    u32::from(first_response == Some(correct))
}

// ── Trial log ─────────────────────────────────────────────────────────────────

/// One completed trial, as handed to persistence.
///
/// The race outcome and scores come from the initiator's `stage_feedback`,
/// never from the local peer's own view of who answered first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialLog {
    pub trial: u32,
    pub seed: u64,
    pub target_position: u8,
    pub correct_category: Category,
    pub local_response: Option<ResponseRecord>,
    pub remote_response: Option<ResponseRecord>,
    pub first_responder: Option<PeerRole>,
    pub first_response: Option<Category>,
    pub trial_score: u32,
    pub total_score: u32,
    pub spatial_layout: SpatialLayout,
    pub target_coordinates: Option<(f64, f64)>,
}

impl TrialLog {
    pub fn new(
        params: &TrialParameters,
        layout: SpatialLayout,
        local_response: Option<ResponseRecord>,
        remote_response: Option<ResponseRecord>,
        feedback: &Feedback,
    ) -> Self {
        let target_coordinates = layout
            .cell(params.target_position)
            .map(|c| (c.center_x, c.center_y));
        Self {
            trial: params.trial_number,
            seed: params.seed,
            target_position: params.target_position,
            correct_category: feedback.correct_category,
            local_response,
            remote_response,
            first_responder: feedback.first_responder,
            first_response: feedback.first_response,
            trial_score: feedback.trial_score,
            total_score: feedback.total_score,
            spatial_layout: layout,
            target_coordinates,
        }
    }
}

/// Append-only record of completed trials, ordered by trial number.
#[derive(Debug, Clone, Default)]
pub struct TrialLogBook {
    entries: Vec<TrialLog>,
}

impl TrialLogBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a trial. Returns false (and keeps nothing) if a trial with the
    /// same or a later number is already recorded, e.g. a duplicated
    /// `stage_feedback` datagram.
    pub fn append(&mut self, log: TrialLog) -> bool {
        if let Some(last) = self.entries.last() {
            if log.trial <= last.trial {
                return false;
            }
        }
        self.entries.push(log);
        true
    }

    pub fn entries(&self) -> &[TrialLog] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_score(&self) -> u32 {
        self.entries.last().map(|l| l.total_score).unwrap_or(0)
    }

    pub fn into_entries(self) -> Vec<TrialLog> {
        self.entries
    }
}
