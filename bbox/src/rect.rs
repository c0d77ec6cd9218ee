use super::XYXY;
use crate::common::*;

/// The generic axis-aligned rectangle.
pub trait Rect {
    type Type;

    fn x1(&self) -> Self::Type;
    fn y1(&self) -> Self::Type;
    fn x2(&self) -> Self::Type;
    fn y2(&self) -> Self::Type;
    fn cx(&self) -> Self::Type;
    fn cy(&self) -> Self::Type;
    fn w(&self) -> Self::Type;
    fn h(&self) -> Self::Type;

    fn try_from_xyxy(xyxy: [Self::Type; 4]) -> Result<Self>
    where
        Self: Sized;

    fn try_from_cxcywh(cxcywh: [Self::Type; 4]) -> Result<Self>
    where
        Self: Sized;
}

pub trait RectNum: Rect
where
    Self::Type: Num + PartialOrd,
{
    fn xyxy(&self) -> [Self::Type; 4] {
        [self.x1(), self.y1(), self.x2(), self.y2()]
    }

    fn cxcywh(&self) -> [Self::Type; 4] {
        [self.cx(), self.cy(), self.w(), self.h()]
    }

    fn area(&self) -> <Self::Type as Mul<Self::Type>>::Output
    where
        Self::Type: Mul<Self::Type>,
    {
        self.w() * self.h()
    }

    /// A box with zero width or zero height covers no area.
    fn is_degenerate(&self) -> bool {
        let zero = Self::Type::zero();
        !(self.w() > zero && self.h() > zero)
    }
}

pub trait RectFloat: RectNum
where
    Self::Type: Float,
{
    /// Compute the intersection rectangle, or `None` if the boxes do not overlap.
    fn intersect_with<R>(&self, other: &R) -> Option<XYXY<Self::Type>>
    where
        R: Rect<Type = Self::Type>,
    {
        let x1 = self.x1().max(other.x1());
        let y1 = self.y1().max(other.y1());
        let x2 = self.x2().min(other.x2());
        let y2 = self.y2().min(other.y2());
        (x2 > x1 && y2 > y1).then(|| XYXY { x1, y1, x2, y2 })
    }

    fn intersection_area_with<R>(&self, other: &R) -> Self::Type
    where
        R: Rect<Type = Self::Type>,
    {
        self.intersect_with(other)
            .map(|rect| rect.area())
            .unwrap_or_else(Self::Type::zero)
    }

    /// Intersection over union. Degenerate boxes and empty unions yield zero.
    fn iou_with<R>(&self, other: &R) -> Self::Type
    where
        R: Rect<Type = Self::Type>,
    {
        let zero = Self::Type::zero();
        if self.is_degenerate() || other.is_degenerate() {
            return zero;
        }

        let inter_area = self.intersection_area_with(other);
        let union_area = self.area() + other.w() * other.h() - inter_area;
        if union_area > zero {
            inter_area / union_area
        } else {
            zero
        }
    }
}

impl<T> RectNum for T
where
    T: Rect,
    T::Type: Num + PartialOrd,
{
}

impl<T> RectFloat for T
where
    T: Rect,
    T::Type: Float,
{
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CxCyWH;
    use approx::assert_abs_diff_eq;

    #[test]
    fn iou_is_symmetric() -> Result<()> {
        let lhs = XYXY::try_from_xyxy([0.0, 0.0, 4.0, 4.0])?;
        let rhs = XYXY::try_from_xyxy([2.0, 2.0, 6.0, 6.0])?;
        assert_abs_diff_eq!(lhs.iou_with(&rhs), rhs.iou_with(&lhs));
        assert_abs_diff_eq!(lhs.iou_with(&rhs), 4.0 / 28.0, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn iou_with_itself_is_one() -> Result<()> {
        let rect = CxCyWH::try_from_cxcywh([3.0f32, 5.0, 2.0, 7.0])?;
        assert_abs_diff_eq!(rect.iou_with(&rect), 1.0);
        Ok(())
    }

    #[test]
    fn disjoint_and_degenerate_boxes_have_zero_iou() -> Result<()> {
        let lhs = XYXY::try_from_xyxy([0.0, 0.0, 1.0, 1.0])?;
        let far = XYXY::try_from_xyxy([5.0, 5.0, 6.0, 6.0])?;
        let touching = XYXY::try_from_xyxy([1.0, 0.0, 2.0, 1.0])?;
        let flat = XYXY::try_from_xyxy([0.0, 0.5, 1.0, 0.5])?;
        assert_eq!(lhs.iou_with(&far), 0.0);
        assert_eq!(lhs.iou_with(&touching), 0.0);
        assert_eq!(lhs.iou_with(&flat), 0.0);
        assert_eq!(flat.iou_with(&flat), 0.0);
        Ok(())
    }

    #[test]
    fn mixed_formats_agree() -> Result<()> {
        let corner = XYXY::try_from_xyxy([10.0, 10.0, 50.0, 50.0])?;
        let center = CxCyWH::try_from_cxcywh([30.0, 30.0, 40.0, 40.0])?;
        assert_abs_diff_eq!(corner.iou_with(&center), 1.0);
        assert_eq!(corner.cxcywh(), center.cxcywh());
        assert_eq!(corner.xyxy(), center.xyxy());
        Ok(())
    }
}
