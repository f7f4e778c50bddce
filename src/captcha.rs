//! Slide-CAPTCHA solver.
//!
//! One solve walks: probe the puzzle container, download the background and
//! the composite instruction image, gate the three template thirds, propose
//! gap regions, match every template against every region, then click the
//! three matched positions and read the verdict. Any failed stage triggers
//! the widget's own reload control and another round, up to a fixed bound.

use std::time::Duration;

use image::GrayImage;
use log::{debug, info, warn};

use crate::browser::{Session, Wait};
use crate::error::CheckinError;
use crate::matcher;
use crate::util;
use crate::vision::{GapDetector, Region, TemplateGate, TemplateLabel, VisionModels};

const SLIDE_BG: &str = "#slideBg";
const INSTRUCTION_IMG: &str = "#instruction div img";
const CONFIRM: &str = "#tcStatus > div:nth-of-type(2) > div:nth-of-type(2) > div > div";
const VERDICT: &str = "#tcOperation";
const RELOAD: &str = "#reload";
/// Only class value accepted as a pass.
const VERDICT_SUCCESS_CLASS: &str = "tc-opera pointer show-success";

/// Settle time after submitting before the verdict element is trusted.
const VERDICT_SETTLE: Duration = Duration::from_secs(5);
/// Settle time around a reload click.
const RELOAD_SETTLE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SolverConfig {
    /// Solve rounds before giving up. Bounds the refresh loop explicitly.
    pub max_rounds: u32,
    /// Short wait for the puzzle container; absence means no CAPTCHA.
    pub probe_timeout: Duration,
    /// Wait for elements the widget is known to render.
    pub wait_timeout: Duration,
    /// Per-image download budget.
    pub download_timeout: Duration,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_rounds: 5,
            probe_timeout: Duration::from_secs(3),
            wait_timeout: Duration::from_secs(10),
            download_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveOutcome {
    /// The widget reported success.
    Passed { rounds: u32 },
    /// The puzzle container never appeared; the CAPTCHA was not triggered.
    Absent,
    /// The round budget ran out.
    Abandoned { rounds: u32 },
}

#[derive(Debug, Clone, Copy)]
enum SolveState {
    Probing,
    Downloading,
    Classifying,
    Matching,
    Answering,
    Verifying,
    Refreshing,
}

fn log_state(round: u32, state: SolveState) {
    debug!("captcha round {} state {:?}", round + 1, state);
}

/// One template's chosen region and the score that won it.
#[derive(Debug, Clone, Copy)]
pub struct Assignment {
    pub region: Region,
    pub similarity: f64,
}

#[derive(Debug)]
enum RefreshReason {
    DegenerateTemplate(usize),
    NoCandidates,
    NoMatch,
    AmbiguousAssignment,
}

enum PuzzleDecision {
    Refresh(RefreshReason),
    Answer([Assignment; 3]),
}

pub struct CaptchaSolver<'a> {
    session: &'a Session,
    http: &'a reqwest::Client,
    models: &'a VisionModels,
    cfg: &'a SolverConfig,
}

impl<'a> CaptchaSolver<'a> {
    pub fn new(
        session: &'a Session,
        http: &'a reqwest::Client,
        models: &'a VisionModels,
        cfg: &'a SolverConfig,
    ) -> Self {
        Self {
            session,
            http,
            models,
            cfg,
        }
    }

    /// Run the bounded solve loop. Never recurses; every refresh costs a
    /// round and the loop ends in `Passed` or `Abandoned`.
    pub async fn solve(&self) -> Result<SolveOutcome, CheckinError> {
        for round in 0..self.cfg.max_rounds {
            log_state(round, SolveState::Probing);
            match self.session.wait_visible(SLIDE_BG, self.cfg.probe_timeout).await? {
                Wait::TimedOut => {
                    if round == 0 {
                        return Ok(SolveOutcome::Absent);
                    }
                    // The puzzle was on screen before the refresh; count a
                    // missing container as a failed round.
                    warn!("puzzle container missing after reload");
                    continue;
                }
                Wait::Found => {}
            }

            let passed = match self.attempt_round(round).await {
                Ok(passed) => passed,
                Err(CheckinError::PageTimeout(what)) => {
                    warn!("captcha round {}: wait expired on {}", round + 1, what);
                    false
                }
                Err(CheckinError::Infrastructure(what)) => {
                    warn!("captcha round {}: {}", round + 1, what);
                    false
                }
                Err(other) => return Err(other),
            };

            if passed {
                info!("captcha passed on round {}", round + 1);
                return Ok(SolveOutcome::Passed { rounds: round });
            }
            if round + 1 < self.cfg.max_rounds {
                log_state(round, SolveState::Refreshing);
                self.refresh().await?;
            }
        }
        warn!("captcha abandoned after {} rounds", self.cfg.max_rounds);
        Ok(SolveOutcome::Abandoned {
            rounds: self.cfg.max_rounds,
        })
    }

    async fn attempt_round(&self, round: u32) -> Result<bool, CheckinError> {
        log_state(round, SolveState::Downloading);
        let style = match self.session.attr(SLIDE_BG, "style").await? {
            Some(style) => style,
            None => return Ok(false),
        };
        let bg_url = match util::url_from_style(&style) {
            Some(url) => url,
            None => {
                warn!("puzzle background style carries no url");
                return Ok(false);
            }
        };
        if let Wait::TimedOut = self
            .session
            .wait_visible(INSTRUCTION_IMG, self.cfg.wait_timeout)
            .await?
        {
            return Err(CheckinError::PageTimeout("instruction image".into()));
        }
        let composite_url = match self.session.attr(INSTRUCTION_IMG, "src").await? {
            Some(src) => src,
            None => return Ok(false),
        };

        let background = self.download_gray(&bg_url).await?;
        let composite = self.download_gray(&composite_url).await?;

        log_state(round, SolveState::Classifying);
        let thirds = split_thirds(&composite);
        if let Some(idx) = degenerate_index(self.models.gate(), &thirds) {
            info!(
                "captcha round {}: refreshing ({:?})",
                round + 1,
                RefreshReason::DegenerateTemplate(idx)
            );
            return Ok(false);
        }

        log_state(round, SolveState::Matching);
        let decision = match_templates(
            self.models.detector(),
            &background,
            &thirds,
            matcher::similarity,
        );
        let assignments = match decision {
            PuzzleDecision::Refresh(reason) => {
                info!("captcha round {}: refreshing ({:?})", round + 1, reason);
                return Ok(false);
            }
            PuzzleDecision::Answer(assignments) => assignments,
        };

        log_state(round, SolveState::Answering);
        let natural = background.dimensions();
        for (idx, assignment) in assignments.iter().enumerate() {
            let (cx, cy) = assignment.region.center();
            info!(
                "template {} matched at ({}, {}) similarity {:.3}",
                idx + 1,
                cx,
                cy,
                assignment.similarity
            );
            // Re-read the displayed size each time; the widget can rescale.
            let style = self
                .session
                .attr(SLIDE_BG, "style")
                .await?
                .unwrap_or_default();
            let displayed = match (util::width_from_style(&style), util::height_from_style(&style)) {
                (Some(w), Some(h)) => (w, h),
                _ => {
                    warn!("puzzle background style carries no size");
                    return Ok(false);
                }
            };
            let (dx, dy) = drag_offset(natural, displayed, (cx, cy));
            self.session.click_offset(SLIDE_BG, dx, dy).await?;
        }

        if let Wait::TimedOut = self.session.wait_visible(CONFIRM, self.cfg.wait_timeout).await? {
            return Err(CheckinError::PageTimeout("confirm control".into()));
        }
        info!("submitting captcha answer");
        self.session.click(CONFIRM).await?;

        log_state(round, SolveState::Verifying);
        tokio::time::sleep(VERDICT_SETTLE).await;
        if let Wait::TimedOut = self.session.wait_visible(VERDICT, self.cfg.wait_timeout).await? {
            return Err(CheckinError::PageTimeout("verdict element".into()));
        }
        let class = self.session.attr(VERDICT, "class").await?.unwrap_or_default();
        Ok(class == VERDICT_SUCCESS_CLASS)
    }

    async fn refresh(&self) -> Result<(), CheckinError> {
        tokio::time::sleep(RELOAD_SETTLE).await;
        match self.session.wait_visible(RELOAD, self.cfg.probe_timeout).await? {
            Wait::Found => self.session.click(RELOAD).await?,
            Wait::TimedOut => warn!("reload control not found"),
        }
        tokio::time::sleep(RELOAD_SETTLE).await;
        Ok(())
    }

    async fn download_gray(&self, url: &str) -> Result<GrayImage, CheckinError> {
        let bytes = self
            .http
            .get(url)
            .timeout(self.cfg.download_timeout)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| CheckinError::Infrastructure(format!("image download failed: {}", e)))?
            .bytes()
            .await
            .map_err(|e| CheckinError::Infrastructure(format!("image download failed: {}", e)))?;
        let img = image::load_from_memory(&bytes)
            .map_err(|e| CheckinError::Infrastructure(format!("image decode failed: {}", e)))?;
        Ok(img.to_luma8())
    }
}

/// Split the composite instruction image into its three equal-width
/// template thirds, in display order.
fn split_thirds(composite: &GrayImage) -> [GrayImage; 3] {
    let (w, h) = composite.dimensions();
    let third = w / 3;
    let crop = |i: u32| image::imageops::crop_imm(composite, i * third, 0, third, h).to_image();
    [crop(0), crop(1), crop(2)]
}

fn crop_region(img: &GrayImage, region: &Region) -> GrayImage {
    image::imageops::crop_imm(img, region.x1, region.y1, region.width(), region.height()).to_image()
}

/// First template third the gate rejects, if any.
fn degenerate_index(gate: &dyn TemplateGate, thirds: &[GrayImage; 3]) -> Option<usize> {
    thirds
        .iter()
        .position(|third| gate.classify(third) == TemplateLabel::Degenerate)
}

/// The whole pure decision in the order the solver runs it: gate the
/// templates, then detect and match. Kept as one function so the decision
/// sequence itself can be exercised without a browser.
#[cfg(test)]
fn evaluate_puzzle<F>(
    gate: &dyn TemplateGate,
    detector: &dyn GapDetector,
    background: &GrayImage,
    composite: &GrayImage,
    sim: F,
) -> PuzzleDecision
where
    F: FnMut(&GrayImage, &GrayImage) -> (f64, usize),
{
    let thirds = split_thirds(composite);
    if let Some(idx) = degenerate_index(gate, &thirds) {
        return PuzzleDecision::Refresh(RefreshReason::DegenerateTemplate(idx));
    }
    match_templates(detector, background, &thirds, sim)
}

/// Detect candidate regions and assign each template its best-scoring one.
fn match_templates<F>(
    detector: &dyn GapDetector,
    background: &GrayImage,
    thirds: &[GrayImage; 3],
    mut sim: F,
) -> PuzzleDecision
where
    F: FnMut(&GrayImage, &GrayImage) -> (f64, usize),
{
    let regions = detector.detect(background);
    if regions.is_empty() {
        return PuzzleDecision::Refresh(RefreshReason::NoCandidates);
    }

    let patches: Vec<GrayImage> = regions.iter().map(|r| crop_region(background, r)).collect();
    // Best region per template; strictly-better replaces, so ties keep the
    // first-seen region.
    let mut best: [Option<(usize, f64)>; 3] = [None, None, None];
    for (ri, patch) in patches.iter().enumerate() {
        for (ti, third) in thirds.iter().enumerate() {
            let (score, _) = sim(third, patch);
            match best[ti] {
                Some((_, current)) if score <= current => {}
                _ => best[ti] = Some((ri, score)),
            }
        }
    }

    let mut chosen = [(0usize, 0f64); 3];
    for (ti, entry) in best.iter().enumerate() {
        match entry {
            Some((ri, score)) => chosen[ti] = (*ri, *score),
            None => return PuzzleDecision::Refresh(RefreshReason::NoMatch),
        }
    }
    // A region may answer at most one template.
    if chosen[0].0 == chosen[1].0 || chosen[0].0 == chosen[2].0 || chosen[1].0 == chosen[2].0 {
        return PuzzleDecision::Refresh(RefreshReason::AmbiguousAssignment);
    }

    PuzzleDecision::Answer([
        Assignment {
            region: regions[chosen[0].0],
            similarity: chosen[0].1,
        },
        Assignment {
            region: regions[chosen[1].0],
            similarity: chosen[1].1,
        },
        Assignment {
            region: regions[chosen[2].0],
            similarity: chosen[2].1,
        },
    ])
}

/// Convert a match center from background pixel space into a click offset
/// relative to the displayed element's own center.
///
/// The displayed/natural ratio is taken independently per axis; the half
/// extents shift the origin from the element's top-left to its center.
fn drag_offset(natural: (u32, u32), displayed: (f64, f64), center: (u32, u32)) -> (f64, f64) {
    let sx = displayed.0 / natural.0 as f64;
    let sy = displayed.1 / natural.1 as f64;
    (
        center.0 as f64 * sx - displayed.0 / 2.0,
        center.1 as f64 * sy - displayed.1 / 2.0,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use std::cell::Cell;

    struct FixedDetector(Vec<Region>);

    impl GapDetector for FixedDetector {
        fn detect(&self, _: &GrayImage) -> Vec<Region> {
            self.0.clone()
        }
    }

    struct CountingDetector<'a> {
        calls: &'a Cell<usize>,
        regions: Vec<Region>,
    }

    impl GapDetector for CountingDetector<'_> {
        fn detect(&self, _: &GrayImage) -> Vec<Region> {
            self.calls.set(self.calls.get() + 1);
            self.regions.clone()
        }
    }

    struct FixedGate(Vec<TemplateLabel>);

    impl TemplateGate for FixedGate {
        fn classify(&self, patch: &GrayImage) -> TemplateLabel {
            // Thirds are distinguishable by their fill value in these tests.
            let v = patch.get_pixel(0, 0)[0] as usize;
            self.0[v]
        }
    }

    struct AllLegible;

    impl TemplateGate for AllLegible {
        fn classify(&self, _: &GrayImage) -> TemplateLabel {
            TemplateLabel::Legible
        }
    }

    fn region(i: u32) -> Region {
        Region {
            x1: i * 20,
            y1: 0,
            x2: i * 20 + 16,
            y2: 16,
        }
    }

    /// Composite whose third `i` is filled with value `i`, so test gates
    /// can address thirds by index.
    fn indexed_composite() -> GrayImage {
        let mut img = GrayImage::from_pixel(90, 30, Luma([0]));
        for y in 0..30 {
            for x in 0..90 {
                img.put_pixel(x, y, Luma([(x / 30) as u8]));
            }
        }
        img
    }

    fn background() -> GrayImage {
        GrayImage::from_pixel(120, 40, Luma([128]))
    }

    #[test]
    fn split_thirds_are_equal_width() {
        let thirds = split_thirds(&indexed_composite());
        for (i, t) in thirds.iter().enumerate() {
            assert_eq!(t.dimensions(), (30, 30));
            assert_eq!(t.get_pixel(0, 0)[0], i as u8);
        }
    }

    #[test]
    fn degenerate_template_refreshes_without_detection() {
        let calls = Cell::new(0);
        let detector = CountingDetector {
            calls: &calls,
            regions: vec![region(0), region(1), region(2)],
        };
        let gate = FixedGate(vec![
            TemplateLabel::Legible,
            TemplateLabel::Degenerate,
            TemplateLabel::Legible,
        ]);
        let decision = evaluate_puzzle(&gate, &detector, &background(), &indexed_composite(), |_, _| {
            (1.0, 1)
        });
        assert!(matches!(
            decision,
            PuzzleDecision::Refresh(RefreshReason::DegenerateTemplate(1))
        ));
        assert_eq!(calls.get(), 0, "detector ran despite a degenerate template");
    }

    #[test]
    fn empty_candidates_refresh_without_matching() {
        let mut matcher_calls = 0;
        let decision = evaluate_puzzle(
            &AllLegible,
            &FixedDetector(Vec::new()),
            &background(),
            &indexed_composite(),
            |_, _| {
                matcher_calls += 1;
                (1.0, 1)
            },
        );
        assert!(matches!(
            decision,
            PuzzleDecision::Refresh(RefreshReason::NoCandidates)
        ));
        assert_eq!(matcher_calls, 0, "matcher ran despite empty candidates");
    }

    #[test]
    fn duplicate_assignment_forces_refresh() {
        // Identical scores everywhere, so every template keeps region 0.
        let detector = FixedDetector(vec![region(0), region(1), region(2)]);
        let decision = evaluate_puzzle(
            &AllLegible,
            &detector,
            &background(),
            &indexed_composite(),
            |_, _| (0.9, 3),
        );
        assert!(matches!(
            decision,
            PuzzleDecision::Refresh(RefreshReason::AmbiguousAssignment)
        ));
    }

    #[test]
    fn distinct_best_regions_are_accepted_in_template_order() {
        let mut call = 0usize;
        let scores = [
            // region 0 vs t0,t1,t2 / region 1 / region 2
            [0.2, 0.8, 0.1],
            [0.9, 0.3, 0.2],
            [0.1, 0.2, 0.7],
        ];
        let decision = evaluate_puzzle(
            &AllLegible,
            &FixedDetector(vec![region(0), region(1), region(2)]),
            &background(),
            &indexed_composite(),
            |_, _| {
                let ri = call / 3;
                let ti = call % 3;
                call += 1;
                (scores[ri][ti], 1)
            },
        );
        match decision {
            PuzzleDecision::Answer(assignments) => {
                assert_eq!(assignments[0].region, region(1));
                assert_eq!(assignments[1].region, region(0));
                assert_eq!(assignments[2].region, region(2));
                assert!((assignments[0].similarity - 0.9).abs() < f64::EPSILON);
            }
            PuzzleDecision::Refresh(reason) => panic!("unexpected refresh: {:?}", reason),
        }
    }

    #[test]
    fn ties_keep_the_first_seen_region() {
        let detector = FixedDetector(vec![region(0), region(1), region(2), region(3)]);
        let mut call = 0usize;
        // Template 0 ties on regions 0 and 3; 1 and 2 have distinct peaks.
        let scores = [
            [0.5, 0.1, 0.1],
            [0.1, 0.6, 0.1],
            [0.1, 0.1, 0.7],
            [0.5, 0.2, 0.2],
        ];
        let decision = evaluate_puzzle(
            &AllLegible,
            &detector,
            &background(),
            &indexed_composite(),
            |_, _| {
                let ri = call / 3;
                let ti = call % 3;
                call += 1;
                (scores[ri][ti], 1)
            },
        );
        match decision {
            PuzzleDecision::Answer(assignments) => assert_eq!(assignments[0].region, region(0)),
            PuzzleDecision::Refresh(reason) => panic!("unexpected refresh: {:?}", reason),
        }
    }

    #[test]
    fn drag_offset_scales_linearly() {
        let natural = (340u32, 212u32);
        let center = (120u32, 80u32);
        let (x1, y1) = drag_offset(natural, (340.0, 212.0), center);
        for k in [0.5f64, 2.0, 3.5] {
            let (xk, yk) = drag_offset(natural, (340.0 * k, 212.0 * k), center);
            assert!((xk - x1 * k).abs() < 1e-9, "x offset not linear at k={}", k);
            assert!((yk - y1 * k).abs() < 1e-9, "y offset not linear at k={}", k);
        }
    }

    #[test]
    fn drag_offset_is_center_relative() {
        // A match at the exact image center lands on the element center.
        let (dx, dy) = drag_offset((200, 100), (200.0, 100.0), (100, 50));
        assert_eq!((dx, dy), (0.0, 0.0));
    }
}
