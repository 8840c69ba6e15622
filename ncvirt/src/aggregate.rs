use std::cmp;
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use ndarray::SliceInfoElem;

use crate::{
    array::{check_bounds, check_payload, NcArray},
    block::{region, Block, DataType},
    dataset::NcDataset,
    errors::{Error, Result},
    store::{AttrSet, AttrValue, Dimension},
};

/// How members are joined along the aggregation dimension.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggMode {
    /// The dimension already exists in every member and is extended; each
    /// member contributes a contiguous run.
    Concat,
    /// The dimension is newly introduced as the leading axis; each member
    /// contributes one slice.
    Stack,
}

/// One logical array synthesized from an ordered collection of member
/// entities sharing all dimensions except the aggregation dimension.
///
/// A ranged request is routed to the members whose runs intersect it; the
/// member reads run concurrently and the returned slices are reassembled
/// back-to-back in member order, so the result is identical to a strictly
/// sequential member-by-member assembly. Members outside the requested range
/// are not touched.
///
pub struct AggVariable {
    members: Vec<Arc<dyn NcArray>>,
    dim: String,
    mode: AggMode,
    axis: usize,
    extents: Vec<usize>,
    offsets: Vec<usize>,
    dims: Vec<Dimension>,
    dtype: DataType,
}

impl AggVariable {
    /// Validate the members and fix their order. Every member must agree
    /// with the first on element type and on every non-aggregation dimension,
    /// by name and length; mismatches fail here rather than at read time.
    pub fn new(members: Vec<Arc<dyn NcArray>>, dim: &str, mode: AggMode) -> Result<Self> {
        let first = members
            .first()
            .ok_or_else(|| Error::structure(0, "aggregation requires at least one member"))?;
        let reference = first.dimensions();
        let dtype = first.dtype();

        let axis = match mode {
            AggMode::Concat => reference
                .iter()
                .position(|d| d.name == dim)
                .ok_or_else(|| {
                    Error::structure(0, format!("member has no dimension named {dim}"))
                })?,
            AggMode::Stack => {
                if reference.iter().any(|d| d.name == dim) {
                    return Err(Error::structure(
                        0,
                        format!("dimension {dim} already exists; stacking introduces a new one"),
                    ));
                }
                0
            }
        };

        let mut extents = Vec::with_capacity(members.len());
        for (index, member) in members.iter().enumerate() {
            let dims = member.dimensions();
            if member.dtype() != dtype {
                return Err(Error::structure(
                    index,
                    format!(
                        "element type {:?} does not match the first member's {:?}",
                        member.dtype(),
                        dtype
                    ),
                ));
            }
            if dims.len() != reference.len() {
                return Err(Error::structure(
                    index,
                    format!(
                        "rank {} does not match the first member's {}",
                        dims.len(),
                        reference.len()
                    ),
                ));
            }
            for (pos, (d, r)) in dims.iter().zip(&reference).enumerate() {
                if d.name != r.name {
                    return Err(Error::structure(
                        index,
                        format!(
                            "dimension {} is named {}, expected {}",
                            pos, d.name, r.name
                        ),
                    ));
                }
                let joined = mode == AggMode::Concat && pos == axis;
                if !joined && d.len != r.len {
                    return Err(Error::structure(
                        index,
                        format!(
                            "dimension {} has length {}, expected {}",
                            d.name, d.len, r.len
                        ),
                    ));
                }
            }
            extents.push(match mode {
                AggMode::Concat => dims[axis].len,
                AggMode::Stack => 1,
            });
        }

        let mut offsets = Vec::with_capacity(extents.len());
        let mut total = 0;
        for extent in &extents {
            offsets.push(total);
            total += extent;
        }

        let dims = match mode {
            AggMode::Concat => {
                let mut dims = reference;
                dims[axis].len = total;
                dims
            }
            AggMode::Stack => {
                let mut dims = vec![Dimension::new(dim, total)];
                dims.extend(reference);
                dims
            }
        };

        Ok(Self {
            members,
            dim: dim.to_string(),
            mode,
            axis,
            extents,
            offsets,
            dims,
            dtype,
        })
    }

    /// The ordered member entities.
    pub fn members(&self) -> &[Arc<dyn NcArray>] {
        &self.members
    }

    /// The name of the aggregation dimension.
    pub fn aggregation_dim(&self) -> &str {
        &self.dim
    }

    pub fn mode(&self) -> AggMode {
        self.mode
    }

    fn ident(&self) -> String {
        format!("aggregate({})", self.dim)
    }

    /// Member coordinates for the part of `lo..hi` owned by member `index`,
    /// or `None` when the member's run does not intersect the request.
    fn intersect(&self, index: usize, lo: usize, hi: usize) -> Option<(usize, usize)> {
        let offset = self.offsets[index];
        let extent = self.extents[index];
        let from = cmp::max(lo, offset);
        let to = cmp::min(hi, offset + extent);
        (from < to).then(|| (from - offset, to - from))
    }

    /// Drop the aggregation axis from a request, for stack-mode members that
    /// do not have it.
    fn member_request(&self, start: &[usize], count: &[usize], local: usize, len: usize)
        -> (Vec<usize>, Vec<usize>)
    {
        match self.mode {
            AggMode::Concat => {
                let mut s = start.to_vec();
                let mut c = count.to_vec();
                s[self.axis] = local;
                c[self.axis] = len;
                (s, c)
            }
            AggMode::Stack => {
                let mut s = start.to_vec();
                let mut c = count.to_vec();
                s.remove(self.axis);
                c.remove(self.axis);
                (s, c)
            }
        }
    }
}

#[async_trait]
impl NcArray for AggVariable {
    fn dimensions(&self) -> Vec<Dimension> {
        self.dims.clone()
    }

    fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Aggregated attributes are read from the first member.
    fn attrs(&self) -> AttrSet {
        self.members[0].attrs()
    }

    async fn read(&self, start: &[usize], count: &[usize]) -> Result<Block> {
        check_bounds(&self.ident(), &self.shape(), start, count)?;
        let lo = start[self.axis];
        let hi = lo + count[self.axis];

        let stack = self.mode == AggMode::Stack;
        let axis = self.axis;
        let mut lens = Vec::new();
        let mut reads = Vec::new();
        for (index, member) in self.members.iter().enumerate() {
            let Some((local, len)) = self.intersect(index, lo, hi) else {
                continue;
            };
            let (mstart, mcount) = self.member_request(start, count, local, len);
            let member = Arc::clone(member);
            lens.push(len);
            reads.push(async move {
                let block = member.read(&mstart, &mcount).await?;
                Ok::<Block, Error>(if stack { block.insert_axis(axis) } else { block })
            });
        }
        // Member reads run concurrently; assembly order stays member order.
        let pieces = try_join_all(reads).await?;

        if pieces.len() == 1 && lens[0] == hi - lo {
            return Ok(pieces.into_iter().next().unwrap());
        }
        let mut shape = count.to_vec();
        shape[self.axis] = hi - lo;
        let mut result = Block::zeros(self.dtype, &shape);
        let mut cursor = 0;
        for (piece, len) in pieces.iter().zip(lens) {
            let mut sel = region(&vec![0; shape.len()], &shape);
            sel[self.axis] = SliceInfoElem::Slice {
                start: cursor as isize,
                end: Some((cursor + len) as isize),
                step: 1,
            };
            result.write_region(&sel, piece)?;
            cursor += len;
        }

        Ok(result)
    }

    /// The payload is split at member boundaries and written member by
    /// member, in order. A failure part way through leaves the earlier
    /// members written; no rollback is attempted.
    async fn write(&self, start: &[usize], count: &[usize], data: &Block) -> Result<()> {
        check_bounds(&self.ident(), &self.shape(), start, count)?;
        check_payload(&self.ident(), count, data)?;
        let lo = start[self.axis];
        let hi = lo + count[self.axis];

        let mut cursor = 0;
        for (index, member) in self.members.iter().enumerate() {
            let Some((local, len)) = self.intersect(index, lo, hi) else {
                continue;
            };
            let mut sel = region(&vec![0; count.len()], count);
            sel[self.axis] = match self.mode {
                AggMode::Concat => SliceInfoElem::Slice {
                    start: cursor as isize,
                    end: Some((cursor + len) as isize),
                    step: 1,
                },
                // The member has no aggregation axis; drop it from the piece.
                AggMode::Stack => SliceInfoElem::Index(cursor as isize),
            };
            let piece = data.read_region(&sel);
            let (mstart, mcount) = self.member_request(start, count, local, len);
            member.write(&mstart, &mcount, &piece).await?;
            cursor += len;
        }

        Ok(())
    }

    /// An attribute write broadcasts to every member so all stay consistent.
    async fn set_attr(&self, name: &str, value: AttrValue) -> Result<()> {
        for member in &self.members {
            member.set_attr(name, value.clone()).await?;
        }

        Ok(())
    }
}

/// An ordered collection of member datasets presented as one dataset whose
/// variables are aggregated along one dimension.
///
/// Member order is fixed at construction; callers present members in logical
/// order, e.g. sorted by filename or by a time coordinate. Variables named in
/// `constants` are taken from the first member only and never routed, as are
/// concatenation-mode variables that do not use the aggregation dimension.
///
pub struct AggDataset {
    members: Vec<Arc<dyn NcDataset>>,
    dim: String,
    mode: AggMode,
    constants: HashSet<String>,
}

impl AggDataset {
    pub fn new(
        members: Vec<Arc<dyn NcDataset>>,
        dim: &str,
        mode: AggMode,
        constants: impl IntoIterator<Item = String>,
    ) -> Result<Self> {
        if members.is_empty() {
            return Err(Error::structure(0, "aggregation requires at least one member"));
        }
        let reference = members[0].dimensions();
        for (index, member) in members.iter().enumerate().skip(1) {
            for r in &reference {
                if mode == AggMode::Concat && r.name == dim {
                    continue;
                }
                match member.dimensions().iter().find(|d| d.name == r.name) {
                    None => {
                        return Err(Error::structure(
                            index,
                            format!("{}: missing dimension {}", member.path(), r.name),
                        ))
                    }
                    Some(d) if d.len != r.len => {
                        return Err(Error::structure(
                            index,
                            format!(
                                "{}: dimension {} has length {}, expected {}",
                                member.path(),
                                r.name,
                                d.len,
                                r.len
                            ),
                        ))
                    }
                    Some(_) => {}
                }
            }
        }

        Ok(Self {
            members,
            dim: dim.to_string(),
            mode,
            constants: constants.into_iter().collect(),
        })
    }

    pub fn members(&self) -> &[Arc<dyn NcDataset>] {
        &self.members
    }

    pub fn aggregation_dim(&self) -> &str {
        &self.dim
    }

    pub fn mode(&self) -> AggMode {
        self.mode
    }

    /// Attributes are read from the first member.
    pub fn attributes(&self) -> AttrSet {
        self.members[0].attributes()
    }

    pub fn variable_names(&self) -> Vec<String> {
        self.members[0].variable_names()
    }

    /// The aggregate dimensions: the first member's, with the aggregation
    /// dimension extended (or introduced).
    pub fn dimensions(&self) -> Vec<Dimension> {
        let mut dims = self.members[0].dimensions();
        match self.mode {
            AggMode::Concat => {
                let total = self
                    .members
                    .iter()
                    .map(|m| {
                        m.dimensions()
                            .iter()
                            .find(|d| d.name == self.dim)
                            .map(|d| d.len)
                            .unwrap_or(0)
                    })
                    .sum();
                if let Some(d) = dims.iter_mut().find(|d| d.name == self.dim) {
                    d.len = total;
                }
            }
            AggMode::Stack => {
                dims.insert(0, Dimension::new(self.dim.clone(), self.members.len()));
            }
        }

        dims
    }

    /// The named variable, aggregated across the members. Constant variables
    /// bypass aggregation and always delegate to the first member.
    pub fn array(&self, name: &str) -> Result<Arc<dyn NcArray>> {
        let first = self.members[0].array(name)?;
        if self.constants.contains(name) {
            return Ok(first);
        }
        if self.mode == AggMode::Concat
            && !first.dimensions().iter().any(|d| d.name == self.dim)
        {
            // A variable that does not use the aggregation dimension cannot
            // be concatenated; take it from the first member.
            return Ok(first);
        }
        let mut arrays = Vec::with_capacity(self.members.len());
        arrays.push(first);
        for member in &self.members[1..] {
            arrays.push(member.array(name)?);
        }

        Ok(Arc::new(AggVariable::new(arrays, &self.dim, self.mode)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{
        deferred::DeferredDataset,
        slice::{DimSel, SliceView},
        store::{OpenMode, Store},
        testing,
    };

    use ndarray::{array, ArrayD, IxDyn};

    /// Three deferred members with `time` extents 10, 5 and 20.
    async fn members(store: &Arc<testing::MemStore>) -> Result<Vec<Arc<dyn NcDataset>>> {
        let mut members: Vec<Arc<dyn NcDataset>> = Vec::new();
        for (path, len, base) in [("m1.nc", 10, 0.0), ("m2.nc", 5, 100.0), ("m3.nc", 20, 200.0)] {
            testing::member_file(store, path, len, 4, base);
            let dataset = DeferredDataset::open(
                Arc::clone(store) as Arc<dyn Store>,
                path,
                OpenMode::Write,
            )
            .await?;
            members.push(Arc::new(dataset));
        }

        Ok(members)
    }

    async fn aggregate(store: &Arc<testing::MemStore>) -> Result<AggDataset> {
        let members = members(store).await?;

        AggDataset::new(members, "time", AggMode::Concat, ["lat".to_string()])
    }

    #[tokio::test]
    async fn test_concat_shape_is_sum_of_extents() -> Result<()> {
        let store = testing::store();
        let agg = aggregate(&store).await?;
        let var = agg.array("temp")?;

        assert_eq!(var.shape(), vec![35, 4]);
        assert_eq!(
            agg.dimensions(),
            vec![Dimension::new("time", 35), Dimension::new("y", 4)]
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_full_read_equals_member_concatenation() -> Result<()> {
        let store = testing::store();
        let agg = aggregate(&store).await?;
        let var = agg.array("temp")?;

        let full = var.read(&[0, 0], &[35, 4]).await?;
        let mut cursor = 0;
        for member in agg.members() {
            let m = member.array("temp")?;
            let extent = m.shape()[0];
            let piece = m.read(&[0, 0], &[extent, 4]).await?;
            let sel = region(&[cursor, 0], &[extent, 4]);
            assert_eq!(full.read_region(&sel), piece);
            cursor += extent;
        }
        assert_eq!(cursor, 35);

        Ok(())
    }

    #[tokio::test]
    async fn test_partial_read_spans_two_members() -> Result<()> {
        let store = testing::store();
        let agg = aggregate(&store).await?;
        let var = agg.array("temp")?;

        // Warm-up is not needed: members are deferred, so opens count member
        // touches directly.
        let opens = [
            store.opens("m1.nc"),
            store.opens("m2.nc"),
            store.opens("m3.nc"),
        ];
        let partial = var.read(&[8, 0], &[10, 4]).await?;
        assert_eq!(store.opens("m1.nc"), opens[0] + 1);
        assert_eq!(store.opens("m2.nc"), opens[1] + 1);
        assert_eq!(store.opens("m3.nc"), opens[2] + 1);

        let full = var.read(&[0, 0], &[35, 4]).await?;
        assert_eq!(partial, full.read_region(&region(&[8, 0], &[10, 4])));

        Ok(())
    }

    #[tokio::test]
    async fn test_concrete_scenario_10_5_20() -> Result<()> {
        let store = testing::store();
        let agg = aggregate(&store).await?;
        let var = agg.array("temp")?;
        assert_eq!(var.shape()[0], 35);

        let opens_m3 = store.opens("m3.nc");
        let block = var.read(&[8, 0], &[10, 1]).await?;
        let values = block.to_f64();

        // Two elements from member 1 (time 8..10), five from member 2, three
        // from member 3, in that order.
        let expected: Vec<f64> = [32.0, 36.0]
            .into_iter()
            .chain([100.0, 104.0, 108.0, 112.0, 116.0])
            .chain([200.0, 204.0, 208.0])
            .collect();
        let expected = ArrayD::from_shape_vec(IxDyn(&[10, 1]), expected).unwrap();
        assert_eq!(values, expected);
        assert_eq!(store.opens("m3.nc"), opens_m3 + 1);

        Ok(())
    }

    #[tokio::test]
    async fn test_untouched_members_are_not_opened() -> Result<()> {
        let store = testing::store();
        let agg = aggregate(&store).await?;
        let var = agg.array("temp")?;

        let opens_m3 = store.opens("m3.nc");
        var.read(&[0, 0], &[12, 4]).await?;
        assert_eq!(store.opens("m3.nc"), opens_m3);

        Ok(())
    }

    #[tokio::test]
    async fn test_structure_mismatch_fails_at_construction() -> Result<()> {
        let store = testing::store();
        let mut members = members(&store).await?;

        // A member whose y dimension disagrees.
        testing::member_file(&store, "bad.nc", 5, 3, 0.0);
        let bad = DeferredDataset::open(
            Arc::clone(&store) as Arc<dyn Store>,
            "bad.nc",
            OpenMode::Read,
        )
        .await?;
        members.push(Arc::new(bad));

        let result = AggDataset::new(members, "time", AggMode::Concat, []);
        match result {
            Err(Error::Structure { member, reason }) => {
                assert_eq!(member, 3);
                assert!(reason.contains("y"), "reason should name the dimension: {reason}");
            }
            Err(other) => panic!("expected a structure error, got {other}"),
            Ok(_) => panic!("expected a structure error"),
        }

        Ok(())
    }

    #[tokio::test]
    async fn test_straddling_write() -> Result<()> {
        let store = testing::store();
        let agg = aggregate(&store).await?;
        let var = agg.array("temp")?;

        let payload = Block::F64(ArrayD::from_elem(IxDyn(&[4, 4]), -5.0));
        var.write(&[8, 0], &[4, 4], &payload).await?;

        let back = var.read(&[8, 0], &[4, 4]).await?;
        assert_eq!(back, payload);
        // Member 2 received its half.
        let m2 = agg.members()[1].array("temp")?;
        assert_eq!(
            m2.read(&[0, 0], &[2, 4]).await?,
            Block::F64(ArrayD::from_elem(IxDyn(&[2, 4]), -5.0))
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_constant_variable_bypasses_routing() -> Result<()> {
        let store = testing::store();
        let agg = aggregate(&store).await?;

        let lat = agg.array("lat")?;
        assert_eq!(lat.shape(), vec![4]);
        let opens = [store.opens("m2.nc"), store.opens("m3.nc")];
        let values = lat.read(&[0], &[4]).await?;
        assert_eq!(
            values,
            Block::F64(array![0.0, 10.0, 20.0, 30.0].into_dyn())
        );
        // Only the first member is ever touched.
        assert_eq!(store.opens("m2.nc"), opens[0]);
        assert_eq!(store.opens("m3.nc"), opens[1]);

        Ok(())
    }

    #[tokio::test]
    async fn test_attr_write_broadcasts() -> Result<()> {
        let store = testing::store();
        let agg = aggregate(&store).await?;
        let mut arrays = Vec::new();
        for member in agg.members() {
            arrays.push(member.array("temp")?);
        }
        let var = AggVariable::new(arrays.clone(), "time", AggMode::Concat)?;

        var.set_attr("units", AttrValue::Str("K".into())).await?;
        for member in &arrays {
            assert_eq!(member.attr("units"), Some(AttrValue::Str("K".into())));
        }
        assert_eq!(var.attr("units"), Some(AttrValue::Str("K".into())));

        // The write went through to storage: a fresh open sees it.
        let reopened = DeferredDataset::open(
            Arc::clone(&store) as Arc<dyn Store>,
            "m2.nc",
            OpenMode::Read,
        )
        .await?;
        let m2 = reopened.array("temp")?;
        assert_eq!(m2.attr("units"), Some(AttrValue::Str("K".into())));

        Ok(())
    }

    #[tokio::test]
    async fn test_stack_mode() -> Result<()> {
        let store = testing::store();
        let mut members: Vec<Arc<dyn NcArray>> = Vec::new();
        for (path, base) in [("s1.nc", 0.0), ("s2.nc", 100.0), ("s3.nc", 200.0)] {
            testing::member_file(&store, path, 2, 4, base);
            let dataset = DeferredDataset::open(
                Arc::clone(&store) as Arc<dyn Store>,
                path,
                OpenMode::Read,
            )
            .await?;
            members.push(dataset.array("temp")?);
        }

        let stacked = AggVariable::new(members, "run", AggMode::Stack)?;
        assert_eq!(stacked.shape(), vec![3, 2, 4]);
        assert_eq!(stacked.aggregation_dim(), "run");

        // One slice per member.
        let block = stacked.read(&[1, 0, 0], &[2, 1, 2]).await?;
        assert_eq!(
            block,
            Block::F64(array![[[100.0, 101.0]], [[200.0, 201.0]]].into_dyn())
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_stack_shape_is_member_count() -> Result<()> {
        let store = testing::store();
        let members = members(&store).await?;
        // Equal-extent members are required for stacking over datasets, so
        // stack arrays of one time step each.
        let mut arrays: Vec<Arc<dyn NcArray>> = Vec::new();
        for member in &members {
            let full = member.array("temp")?;
            arrays.push(Arc::new(SliceView::new(
                full,
                &[DimSel::Point(0), DimSel::All],
            )?));
        }

        let stacked = AggVariable::new(arrays, "run", AggMode::Stack)?;
        assert_eq!(stacked.shape(), vec![3, 4]);
        let block = stacked.read(&[0, 0], &[3, 1]).await?;
        assert_eq!(
            block,
            Block::F64(array![[0.0], [100.0], [200.0]].into_dyn())
        );

        Ok(())
    }
}
