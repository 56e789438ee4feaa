use crate::gcref::{MemberOffset, ObjectRef};

/// Receives every root the runtime enumerates.
pub trait RootVisitor {
    fn visit_root(&mut self, root: ObjectRef);
}

impl<F: FnMut(ObjectRef)> RootVisitor for F {
    #[inline]
    fn visit_root(&mut self, root: ObjectRef) {
        self(root)
    }
}

/// Receives every outgoing reference field of an object.
///
/// `referent` is `None` for null fields. `is_static` is set for static fields of class objects.
pub trait ReferenceVisitor {
    fn visit_reference(
        &mut self,
        owner: ObjectRef,
        referent: Option<ObjectRef>,
        offset: MemberOffset,
        is_static: bool,
    );
}

impl<F: FnMut(ObjectRef, Option<ObjectRef>, MemberOffset, bool)> ReferenceVisitor for F {
    #[inline]
    fn visit_reference(
        &mut self,
        owner: ObjectRef,
        referent: Option<ObjectRef>,
        offset: MemberOffset,
        is_static: bool,
    ) {
        self(owner, referent, offset, is_static)
    }
}

/// Visits only non-null referents, the shape most marking code wants.
pub struct NonNullReferences<F: FnMut(ObjectRef)>(pub F);

impl<F: FnMut(ObjectRef)> ReferenceVisitor for NonNullReferences<F> {
    #[inline]
    fn visit_reference(
        &mut self,
        _owner: ObjectRef,
        referent: Option<ObjectRef>,
        _offset: MemberOffset,
        _is_static: bool,
    ) {
        if let Some(referent) = referent {
            (self.0)(referent);
        }
    }
}
