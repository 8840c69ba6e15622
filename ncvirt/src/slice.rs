use std::sync::Arc;

use async_trait::async_trait;
use ndarray::SliceInfoElem;

use crate::{
    array::{check_bounds, check_payload, NcArray},
    block::{region, Block, DataType},
    errors::{Error, Result},
    store::{AttrSet, AttrValue, Dimension},
};

/// One entry of an index expression, per dimension of the sliced entity.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DimSel {
    /// The full extent of the dimension.
    All,
    /// `start .. stop` with a positive step.
    Range {
        start: usize,
        stop: usize,
        step: usize,
    },
    /// A single index. The dimension is dropped from the view's shape.
    Point(usize),
}

impl DimSel {
    pub fn range(start: usize, stop: usize) -> Self {
        DimSel::Range {
            start,
            stop,
            step: 1,
        }
    }

    pub fn strided(start: usize, stop: usize, step: usize) -> Self {
        DimSel::Range { start, stop, step }
    }
}

/// A normalized selection against a known parent extent.
#[derive(Clone, Copy, Debug)]
enum Sel {
    Range { start: usize, len: usize, step: usize },
    Point(usize),
}

fn normalize(entity: &str, sel: DimSel, extent: usize) -> Result<Sel> {
    match sel {
        DimSel::All => Ok(Sel::Range {
            start: 0,
            len: extent,
            step: 1,
        }),
        DimSel::Range { start, stop, step } => {
            if step == 0 {
                return Err(Error::range(entity, "stride must be positive"));
            }
            if stop > extent || start > stop {
                return Err(Error::range(
                    entity,
                    format!("range {start}..{stop} is out of bounds for extent {extent}"),
                ));
            }
            let len = if stop > start {
                (stop - start - 1) / step + 1
            } else {
                0
            };
            Ok(Sel::Range { start, len, step })
        }
        DimSel::Point(index) => {
            if index >= extent {
                return Err(Error::range(
                    entity,
                    format!("index {index} is out of bounds for extent {extent}"),
                ));
            }
            Ok(Sel::Point(index))
        }
    }
}

/// A rectangular view of a parent entity, without storage of its own.
///
/// Index operations are translated into parent-relative coordinates by one
/// affine step per dimension. Re-slicing composes eagerly: the new view holds
/// the same root parent and a single combined expression, so nesting never
/// adds indirection levels.
///
pub struct SliceView {
    parent: Arc<dyn NcArray>,
    sel: Vec<Sel>,
    dims: Vec<Dimension>,
}

impl SliceView {
    /// Build a view of `parent`. The expression must have one entry per
    /// parent dimension, and every range and point must lie within the
    /// parent's shape.
    pub fn new(parent: Arc<dyn NcArray>, expr: &[DimSel]) -> Result<Self> {
        let parent_dims = parent.dimensions();
        if expr.len() != parent_dims.len() {
            return Err(Error::range(
                "slice",
                format!(
                    "index expression rank {} does not match array rank {}",
                    expr.len(),
                    parent_dims.len()
                ),
            ));
        }
        let mut sel = Vec::with_capacity(expr.len());
        for (e, dim) in expr.iter().zip(&parent_dims) {
            sel.push(normalize(&dim.name, *e, dim.len)?);
        }
        let dims = reduced_dims(&sel, &parent_dims);

        Ok(Self { parent, sel, dims })
    }

    /// Re-slice this view. The result translates directly to the root
    /// parent; slicing a slice is equivalent to slicing once with the
    /// composed expression.
    pub fn slice(&self, expr: &[DimSel]) -> Result<SliceView> {
        if expr.len() != self.dims.len() {
            return Err(Error::range(
                "slice",
                format!(
                    "index expression rank {} does not match view rank {}",
                    expr.len(),
                    self.dims.len()
                ),
            ));
        }
        let mut composed = Vec::with_capacity(self.sel.len());
        let mut pos = 0;
        for sel in &self.sel {
            match *sel {
                Sel::Point(p) => composed.push(Sel::Point(p)),
                Sel::Range { start, len, step } => {
                    let name = &self.dims[pos].name;
                    let inner = normalize(name, expr[pos], len)?;
                    pos += 1;
                    composed.push(match inner {
                        Sel::Range {
                            start: s,
                            len: l,
                            step: st,
                        } => Sel::Range {
                            start: start + s * step,
                            len: l,
                            step: step * st,
                        },
                        Sel::Point(p) => Sel::Point(start + p * step),
                    });
                }
            }
        }
        let dims = reduced_dims(&composed, &self.parent.dimensions());

        Ok(SliceView {
            parent: Arc::clone(&self.parent),
            sel: composed,
            dims,
        })
    }

    /// Translate a view-relative request into parent coordinates, plus the
    /// post-selection that strides and drops axes on the fetched block.
    fn translate(
        &self,
        start: &[usize],
        count: &[usize],
    ) -> (Vec<usize>, Vec<usize>, Vec<SliceInfoElem>, bool) {
        let rank = self.sel.len();
        let mut pstart = Vec::with_capacity(rank);
        let mut pcount = Vec::with_capacity(rank);
        let mut post = Vec::with_capacity(rank);
        let mut strided = false;
        let mut pos = 0;
        for sel in &self.sel {
            match *sel {
                Sel::Point(p) => {
                    pstart.push(p);
                    pcount.push(1);
                    post.push(SliceInfoElem::Index(0));
                }
                Sel::Range { start: s, step, .. } => {
                    let sub_start = start[pos];
                    let sub_count = count[pos];
                    pos += 1;
                    pstart.push(s + sub_start * step);
                    let span = if sub_count == 0 {
                        0
                    } else {
                        (sub_count - 1) * step + 1
                    };
                    pcount.push(span);
                    if step > 1 && sub_count > 1 {
                        strided = true;
                    }
                    post.push(SliceInfoElem::Slice {
                        start: 0,
                        end: None,
                        step: step as isize,
                    });
                }
            }
        }

        (pstart, pcount, post, strided)
    }

    /// Write a request whose strided dimensions all have count one, so the
    /// parent region is contiguous.
    async fn write_direct(&self, start: &[usize], count: &[usize], data: &Block) -> Result<()> {
        let (pstart, pcount, _, _) = self.translate(start, count);
        // Reinsert the point axes dropped from the view's shape.
        let mut full = data.clone();
        for (axis, sel) in self.sel.iter().enumerate() {
            if matches!(sel, Sel::Point(_)) {
                full = full.insert_axis(axis);
            }
        }
        self.parent.write(&pstart, &pcount, &full).await
    }
}

fn reduced_dims(sel: &[Sel], parent_dims: &[Dimension]) -> Vec<Dimension> {
    sel.iter()
        .zip(parent_dims)
        .filter_map(|(s, d)| match s {
            Sel::Point(_) => None,
            Sel::Range { len, .. } => Some(Dimension::new(d.name.clone(), *len)),
        })
        .collect()
}

#[async_trait]
impl NcArray for SliceView {
    fn dimensions(&self) -> Vec<Dimension> {
        self.dims.clone()
    }

    fn dtype(&self) -> DataType {
        self.parent.dtype()
    }

    fn attrs(&self) -> AttrSet {
        self.parent.attrs()
    }

    async fn read(&self, start: &[usize], count: &[usize]) -> Result<Block> {
        check_bounds("slice", &self.shape(), start, count)?;
        let (pstart, pcount, post, _) = self.translate(start, count);
        let block = self.parent.read(&pstart, &pcount).await?;

        Ok(block.read_region(&post))
    }

    async fn write(&self, start: &[usize], count: &[usize], data: &Block) -> Result<()> {
        check_bounds("slice", &self.shape(), start, count)?;
        check_payload("slice", count, data)?;
        let (_, _, _, strided) = self.translate(start, count);
        if !strided {
            return self.write_direct(start, count, data).await;
        }

        // A strided span is not contiguous in the parent, and the block
        // capability has no stride, so write one contiguous run per strided
        // index combination.
        let axes: Vec<usize> = self
            .sel
            .iter()
            .filter(|s| matches!(s, Sel::Range { .. }))
            .enumerate()
            .filter_map(|(axis, s)| match s {
                Sel::Range { step, .. } if *step > 1 && count[axis] > 1 => Some(axis),
                _ => None,
            })
            .collect();
        let mut index = vec![0_usize; axes.len()];
        loop {
            let mut sub_start = start.to_vec();
            let mut sub_count = count.to_vec();
            let mut piece_sel = region(&vec![0; count.len()], count);
            for (k, &axis) in axes.iter().enumerate() {
                sub_start[axis] = start[axis] + index[k];
                sub_count[axis] = 1;
                piece_sel[axis] = SliceInfoElem::Slice {
                    start: index[k] as isize,
                    end: Some(index[k] as isize + 1),
                    step: 1,
                };
            }
            let piece = data.read_region(&piece_sel);
            self.write_direct(&sub_start, &sub_count, &piece).await?;

            // Advance the odometer over the strided axes.
            let mut k = axes.len();
            loop {
                if k == 0 {
                    return Ok(());
                }
                k -= 1;
                index[k] += 1;
                if index[k] < count[axes[k]] {
                    break;
                }
                index[k] = 0;
            }
        }
    }

    async fn set_attr(&self, name: &str, value: AttrValue) -> Result<()> {
        self.parent.set_attr(name, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{dataset::NcDataset, store::OpenMode, testing, Dataset};

    use ndarray::array;

    async fn grid(store: &Arc<testing::MemStore>) -> Result<Arc<dyn NcArray>> {
        // values[t, y, x] = t * 100 + y * 10 + x
        testing::grid_file(store, "g.nc", 4, 3, 5);
        let dataset = Dataset::open(store.as_ref(), "g.nc", OpenMode::Write).await?;

        dataset.array("grid")
    }

    #[tokio::test]
    async fn test_subrange_read() -> Result<()> {
        let store = testing::store();
        let view = SliceView::new(
            grid(&store).await?,
            &[DimSel::range(1, 3), DimSel::All, DimSel::range(2, 5)],
        )?;
        assert_eq!(view.shape(), vec![2, 3, 3]);

        let block = view.read(&[1, 0, 0], &[1, 2, 2]).await?;
        assert_eq!(
            block,
            Block::F64(array![[[202.0, 203.0], [212.0, 213.0]]].into_dyn())
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_point_reduces_rank() -> Result<()> {
        let store = testing::store();
        let view = SliceView::new(
            grid(&store).await?,
            &[DimSel::Point(2), DimSel::All, DimSel::Point(4)],
        )?;
        assert_eq!(view.shape(), vec![3]);

        let block = view.read(&[0], &[3]).await?;
        assert_eq!(block, Block::F64(array![204.0, 214.0, 224.0].into_dyn()));

        Ok(())
    }

    #[tokio::test]
    async fn test_strided_read() -> Result<()> {
        let store = testing::store();
        let view = SliceView::new(
            grid(&store).await?,
            &[DimSel::Point(0), DimSel::Point(1), DimSel::strided(0, 5, 2)],
        )?;
        assert_eq!(view.shape(), vec![3]);

        let block = view.read(&[0], &[3]).await?;
        assert_eq!(block, Block::F64(array![10.0, 12.0, 14.0].into_dyn()));

        Ok(())
    }

    #[tokio::test]
    async fn test_slice_of_slice_equals_composed() -> Result<()> {
        let store = testing::store();
        let parent = grid(&store).await?;

        let outer = SliceView::new(
            Arc::clone(&parent),
            &[DimSel::range(1, 4), DimSel::All, DimSel::strided(0, 5, 2)],
        )?;
        let inner = outer.slice(&[DimSel::range(1, 3), DimSel::Point(2), DimSel::All])?;

        let composed = SliceView::new(
            parent,
            &[DimSel::range(2, 4), DimSel::Point(2), DimSel::strided(0, 5, 2)],
        )?;
        assert_eq!(inner.shape(), composed.shape());
        assert_eq!(
            inner.read(&[0, 0], &[2, 3]).await?,
            composed.read(&[0, 0], &[2, 3]).await?
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_out_of_bounds_at_construction() -> Result<()> {
        let store = testing::store();
        let parent = grid(&store).await?;

        let result = SliceView::new(
            parent,
            &[DimSel::range(0, 5), DimSel::All, DimSel::All],
        );
        assert!(matches!(result, Err(Error::Range { .. })));

        Ok(())
    }

    #[tokio::test]
    async fn test_write_through_view() -> Result<()> {
        let store = testing::store();
        let parent = grid(&store).await?;
        let view = SliceView::new(
            Arc::clone(&parent),
            &[DimSel::Point(1), DimSel::range(1, 3), DimSel::range(0, 2)],
        )?;

        view.write(
            &[0, 0],
            &[2, 2],
            &Block::F64(array![[1.0, 2.0], [3.0, 4.0]].into_dyn()),
        )
        .await?;

        let block = parent.read(&[1, 1, 0], &[1, 2, 2]).await?;
        assert_eq!(
            block,
            Block::F64(array![[[1.0, 2.0], [3.0, 4.0]]].into_dyn())
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_strided_write() -> Result<()> {
        let store = testing::store();
        let parent = grid(&store).await?;
        let view = SliceView::new(
            Arc::clone(&parent),
            &[DimSel::Point(0), DimSel::Point(0), DimSel::strided(0, 5, 2)],
        )?;

        view.write(&[0], &[3], &Block::F64(array![-1.0, -2.0, -3.0].into_dyn()))
            .await?;

        // Every second element replaced, the ones in between untouched.
        let row = parent.read(&[0, 0, 0], &[1, 1, 5]).await?;
        assert_eq!(
            row,
            Block::F64(array![[[-1.0, 1.0, -2.0, 3.0, -3.0]]].into_dyn())
        );

        Ok(())
    }
}
