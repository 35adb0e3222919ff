use {
    sqlx::{
        Decode,
        Encode,
        Postgres,
        Type,
        encode::IsNull,
        error::BoxDynError,
        postgres::{PgArgumentBuffer, PgHasArrayType, PgTypeInfo, PgValueRef},
    },
    std::fmt::{self, Debug, Formatter},
};

/// Wrapper type for fixed size byte arrays compatible with sqlx's Postgres
/// implementation.
#[derive(Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ByteArray<const N: usize>(pub [u8; N]);

impl<const N: usize> Debug for ByteArray<N> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "0x{}", const_hex::encode(self.0))
    }
}

impl<const N: usize> Default for ByteArray<N> {
    fn default() -> Self {
        Self([0; N])
    }
}

impl<const N: usize> Type<Postgres> for ByteArray<N> {
    fn type_info() -> PgTypeInfo {
        <[u8] as Type<Postgres>>::type_info()
    }
}

impl<const N: usize> PgHasArrayType for ByteArray<N> {
    fn array_type_info() -> PgTypeInfo {
        <[&[u8]] as Type<Postgres>>::type_info()
    }
}

impl<const N: usize> Decode<'_, Postgres> for ByteArray<N> {
    fn decode(value: PgValueRef<'_>) -> Result<Self, BoxDynError> {
        let bytes = value.as_bytes()?;
        let array: [u8; N] = bytes
            .try_into()
            .map_err(|_| format!("expected {N} bytes but got {}", bytes.len()))?;
        Ok(Self(array))
    }
}

impl<const N: usize> Encode<'_, Postgres> for ByteArray<N> {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        <&[u8] as Encode<Postgres>>::encode(self.0.as_slice(), buf)
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        sqlx::{Connection, PgConnection, Row},
    };

    #[test]
    fn debug_is_hex() {
        assert_eq!(format!("{:?}", ByteArray([0xab, 0x01])), "0xab01");
    }

    #[tokio::test]
    #[ignore]
    async fn postgres_round_trip() {
        let mut db = PgConnection::connect("postgresql://").await.unwrap();
        let mut db = db.begin().await.unwrap();
        let row = sqlx::query("SELECT $1 AS value")
            .bind(ByteArray([1u8, 2, 3]))
            .fetch_one(&mut *db)
            .await
            .unwrap();
        let value: ByteArray<3> = row.get("value");
        assert_eq!(value.0, [1, 2, 3]);

        let err = sqlx::query("SELECT $1 AS value")
            .bind(ByteArray([1u8, 2]))
            .fetch_one(&mut *db)
            .await
            .unwrap()
            .try_get::<ByteArray<3>, _>("value");
        assert!(err.is_err());
    }
}
